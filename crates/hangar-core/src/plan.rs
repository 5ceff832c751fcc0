//! Build plan definitions.
//!
//! A plan is the pre-validated tree a build executes. The engine compiles it
//! into a step tree once per build attempt; nothing here is interpreted at
//! parse time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{PlanId, TeamName};

/// A resource version, e.g. `{"ref": "abc123"}`.
pub type Version = BTreeMap<String, String>;

/// A node in a build plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    #[serde(flatten)]
    pub kind: PlanKind,
}

impl Plan {
    pub fn new(id: impl Into<PlanId>, kind: PlanKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// What a plan node does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Run a task on a worker.
    Task(TaskPlan),
    /// Fetch a resource version into an artifact.
    Get(GetPlan),
    /// Push artifacts to a resource, producing a new version.
    Put(PutPlan),
    /// Configure a pipeline from a file in an artifact.
    SetPipeline(SetPipelinePlan),
    /// Register an artifact that already exists (e.g. uploaded inputs).
    ArtifactInput(ArtifactInputPlan),
    /// Expose an artifact as a build output.
    ArtifactOutput(ArtifactOutputPlan),
    /// Run sub-plans in order, stopping at the first that fails.
    Do(Vec<Plan>),
    /// Run all sub-plans concurrently.
    Aggregate(Vec<Plan>),
    /// Run sub-plans concurrently with a limit and optional fail-fast.
    InParallel(InParallelPlan),
    /// Run one sub-plan per value of a variable.
    Across(AcrossPlan),
    OnSuccess(HookPlan),
    OnFailure(HookPlan),
    OnAbort(HookPlan),
    OnError(HookPlan),
    Ensure(HookPlan),
    /// Run a sub-plan, turning errors and failures into a plain failure.
    Try(Box<Plan>),
    Retry(RetryPlan),
    Timeout(TimeoutPlan),
}

/// An image fetched through a resource for a task or custom resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResource {
    #[serde(rename = "type")]
    pub type_: String,
    pub source: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// A custom resource type with its pinned version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub source: Value,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// Configuration of a task: what to run and in which image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_resource: Option<ImageResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_uri: Option<String>,
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    #[serde(default)]
    pub outputs: Vec<TaskOutput>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub run: TaskRunConfig,
}

impl TaskConfig {
    /// Check the config is runnable.
    pub fn validate(&self) -> Result<(), String> {
        let mut messages = Vec::new();

        if self.platform.is_empty() {
            messages.push("missing 'platform'".to_string());
        }
        if self.run.path.is_empty() {
            messages.push("missing path to executable to run".to_string());
        }
        for input in &self.inputs {
            if input.name.is_empty() {
                messages.push("input has empty name".to_string());
            }
        }
        for output in &self.outputs {
            if output.name.is_empty() {
                messages.push("output has empty name".to_string());
            }
        }

        if messages.is_empty() {
            Ok(())
        } else {
            Err(messages.join("; "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl TaskInput {
    /// Mount path relative to the task's working directory.
    pub fn mount_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl TaskOutput {
    pub fn mount_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRunConfig {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub name: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub config: TaskConfig,
    /// Use an artifact produced earlier in the build as the task image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_artifact_name: Option<String>,
    /// Task input name -> build artifact name.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// Task output name -> build artifact name.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_types: Vec<VersionedResourceType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPlan {
    /// Artifact name the fetched bits are registered under.
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub source: Value,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Fetch the version produced by an earlier put in this build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_from: Option<PlanId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<VersionedResourceType>,
}

/// Which artifacts a put sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutInputs {
    #[default]
    All,
    Specified(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutPlan {
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub source: Value,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub inputs: PutInputs,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<VersionedResourceType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPipelinePlan {
    /// Pipeline name.
    pub name: String,
    /// Config file path, `<artifact>/<path within artifact>`.
    pub file: String,
    /// Team to set the pipeline in; defaults to the build's team.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamName>,
    #[serde(default)]
    pub vars: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInputPlan {
    pub name: String,
    pub handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactOutputPlan {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InParallelPlan {
    pub steps: Vec<Plan>,
    /// Maximum concurrently running steps; 0 means unbounded.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcrossPlan {
    pub var: String,
    pub values: Vec<Value>,
    pub step: Box<Plan>,
    /// 0 means unbounded.
    #[serde(default)]
    pub max_in_flight: usize,
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookPlan {
    pub step: Box<Plan>,
    pub hook: Box<Plan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPlan {
    pub step: Box<Plan>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutPlan {
    pub step: Box<Plan>,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_config() -> TaskConfig {
        TaskConfig {
            platform: "linux".to_string(),
            rootfs_uri: Some("docker:///alpine".to_string()),
            run: TaskRunConfig {
                path: "sh".to_string(),
                args: vec!["-c".to_string(), "true".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_task_config() {
        assert!(task_config().validate().is_ok());

        let mut config = task_config();
        config.platform.clear();
        config.run.path.clear();
        let err = config.validate().unwrap_err();
        assert!(err.contains("platform"));
        assert!(err.contains("executable"));
    }

    #[test]
    fn test_input_mount_path_defaults_to_name() {
        let input = TaskInput {
            name: "repo".to_string(),
            path: None,
            optional: false,
        };
        assert_eq!(input.mount_path(), "repo");
    }

    #[test]
    fn test_deserialize_nested_plan() {
        let plan: Plan = serde_json::from_value(json!({
            "id": "1",
            "do": [
                {
                    "id": "2",
                    "get": {
                        "name": "repo",
                        "resource": "repo",
                        "type": "git",
                        "source": {"uri": "https://example.com/repo.git"}
                    }
                },
                {
                    "id": "3",
                    "try": {"id": "4", "artifact_output": {"name": "repo"}}
                }
            ]
        }))
        .unwrap();

        let PlanKind::Do(steps) = plan.kind else {
            panic!("expected do plan");
        };
        assert_eq!(steps.len(), 2);
        assert!(matches!(&steps[0].kind, PlanKind::Get(get) if get.resource == "repo"));
        assert!(matches!(&steps[1].kind, PlanKind::Try(inner) if inner.id.as_str() == "4"));
    }
}
