//! Pipeline configuration storage, as seen by the set_pipeline step.

use async_trait::async_trait;
use serde_json::Value;

use crate::artifact::ArtifactHandle;
use crate::context::Context;
use crate::{BuildId, Result, TeamName};

/// Request to configure a pipeline from a file inside an artifact.
#[derive(Debug, Clone)]
pub struct SetPipelineRequest {
    pub team: TeamName,
    pub name: String,
    /// Artifact holding the config file.
    pub artifact: ArtifactHandle,
    /// Path of the config file within the artifact.
    pub path: String,
    pub vars: Value,
    /// Build that is setting the pipeline.
    pub build_id: BuildId,
}

/// Persists pipeline configuration. Reading the file and validating it
/// is the implementation's job.
#[async_trait]
pub trait PipelineSaver: Send + Sync {
    /// Save the pipeline, returning whether its config changed.
    async fn save(&self, ctx: &Context, request: SetPipelineRequest) -> Result<bool>;
}
