//! Worker contracts.
//!
//! Workers run containers for leaf steps. The engine never manages container
//! lifecycle itself: it asks a [`WorkerPool`] for a worker matching a
//! [`WorkerSpec`] and hands the returned [`WorkerClient`] a container spec.

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::artifact::ArtifactHandle;
use crate::context::Context;
use crate::plan::{ImageResource, Version, VersionedResourceType};
use crate::{BuildId, ExecError, PlanId, Result, TeamName};

/// Identifies who a container belongs to, so repeated selection for the
/// same owner can find an existing container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerOwner {
    pub build_id: BuildId,
    pub plan_id: PlanId,
    pub team: TeamName,
}

/// Where a container's root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ImageSource {
    /// An artifact produced earlier in the build.
    Artifact(ArtifactHandle),
    /// A rootfs URI understood by the worker.
    Url(String),
    /// The worker's built-in image for a base resource type.
    ResourceType(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub source: ImageSource,
    pub privileged: bool,
}

/// An artifact mounted into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInput {
    pub name: String,
    pub mount_path: String,
    pub artifact: ArtifactHandle,
}

/// What a container is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    #[display("task")]
    Task,
    #[display("get")]
    Get,
    #[display("put")]
    Put,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub kind: ContainerKind,
    pub team: TeamName,
    pub image: ImageSpec,
    pub dir: String,
    pub env: BTreeMap<String, String>,
    pub inputs: Vec<ContainerInput>,
    /// Output name -> path inside the container.
    pub outputs: BTreeMap<String, String>,
}

/// Constraints a worker must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub platform: Option<String>,
    pub tags: Vec<String>,
    pub resource_type: Option<String>,
    pub team: Option<TeamName>,
}

/// Policy for choosing among eligible workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementStrategy {
    /// Prefer the worker already holding the most input artifacts.
    #[default]
    #[display("volume-locality")]
    VolumeLocality,
    #[display("fewest-build-containers")]
    FewestBuildContainers,
    /// Refuse workers already running `max` tasks.
    #[display("limit-active-tasks")]
    LimitActiveTasks { max: usize },
    #[display("random")]
    Random,
}

impl std::str::FromStr for PlacementStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "volume-locality" => Ok(Self::VolumeLocality),
            "fewest-build-containers" => Ok(Self::FewestBuildContainers),
            "random" => Ok(Self::Random),
            other => match other.strip_prefix("limit-active-tasks:") {
                Some(max) => max
                    .parse()
                    .map(|max| Self::LimitActiveTasks { max })
                    .map_err(|_| format!("invalid active task limit: {}", max)),
                None => Err(format!("unknown placement strategy: {}", other)),
            },
        }
    }
}

/// The process a task runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub dir: Option<String>,
    pub user: Option<String>,
}

/// Exit status of a process; zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    pub const SUCCESS: ExitStatus = ExitStatus(0);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

/// Destination for a stream of process output.
pub trait LogSink: Send + Sync {
    fn write(&self, chunk: Bytes);
}

/// Output streams handed to a worker process.
#[derive(Clone)]
pub struct ProcessIo {
    pub stdout: Arc<dyn LogSink>,
    pub stderr: Arc<dyn LogSink>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// A version produced by a get or put, with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionResult {
    pub version: Version,
    pub metadata: Vec<MetadataField>,
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub exit_status: ExitStatus,
    /// Output name -> artifact holding it.
    pub outputs: BTreeMap<String, ArtifactHandle>,
}

/// A get or put against a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    pub resource: String,
    pub type_: String,
    pub source: Value,
    pub params: Value,
    pub version: Option<Version>,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub exit_status: ExitStatus,
    pub result: Option<VersionResult>,
    pub artifact: Option<ArtifactHandle>,
}

#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub exit_status: ExitStatus,
    pub result: Option<VersionResult>,
}

/// A worker chosen to run a container.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    fn name(&self) -> &str;

    /// Run a task process to completion.
    async fn run_task(
        &self,
        ctx: &Context,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        process: &ProcessSpec,
        io: ProcessIo,
    ) -> Result<TaskOutcome>;

    /// Fetch a resource version into a new artifact.
    async fn fetch(
        &self,
        ctx: &Context,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        request: &ResourceRequest,
        io: ProcessIo,
    ) -> Result<FetchOutcome>;

    /// Push the container inputs to a resource.
    async fn put(
        &self,
        ctx: &Context,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        request: &ResourceRequest,
        io: ProcessIo,
    ) -> Result<PutOutcome>;
}

/// A view of the worker fleet. Implementations serialize their own
/// placement decisions and must be safe to call concurrently.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Choose a worker satisfying `worker_spec`, or `None` if no worker is
    /// eligible right now. Waiting on in-progress container creation must
    /// not exceed `create_timeout`.
    async fn select_worker(
        &self,
        owner: &ContainerOwner,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        strategy: PlacementStrategy,
        create_timeout: Duration,
    ) -> Result<Option<Arc<dyn WorkerClient>>>;

    /// Forget placement state kept for a finished build.
    fn release_build(&self, _build_id: &BuildId) {}
}

/// Resolves image resources (via a check and get of the image's resource
/// type) into a concrete image.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_image(
        &self,
        ctx: &Context,
        image: &ImageResource,
        resource_types: &[VersionedResourceType],
        privileged: bool,
    ) -> Result<ImageSpec>;
}

/// Image fetcher for deployments without image resources.
pub struct NoImageFetcher;

#[async_trait]
impl ImageFetcher for NoImageFetcher {
    async fn fetch_image(
        &self,
        _ctx: &Context,
        image: &ImageResource,
        _resource_types: &[VersionedResourceType],
        _privileged: bool,
    ) -> Result<ImageSpec> {
        Err(ExecError::ImageFetch(format!(
            "no image fetcher configured for image resource of type '{}'",
            image.type_
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_placement_strategy() {
        assert_eq!(
            "fewest-build-containers".parse::<PlacementStrategy>().unwrap(),
            PlacementStrategy::FewestBuildContainers
        );
        assert_eq!(
            "limit-active-tasks:3".parse::<PlacementStrategy>().unwrap(),
            PlacementStrategy::LimitActiveTasks { max: 3 }
        );
        assert!("limit-active-tasks:x".parse::<PlacementStrategy>().is_err());
        assert!("bin-packing".parse::<PlacementStrategy>().is_err());
    }

    #[test]
    fn test_strategy_display() {
        assert_eq!(PlacementStrategy::default().to_string(), "volume-locality");
        assert_eq!(
            PlacementStrategy::LimitActiveTasks { max: 2 }.to_string(),
            "limit-active-tasks"
        );
    }

    #[test]
    fn test_exit_status() {
        assert!(ExitStatus::SUCCESS.is_success());
        assert!(!ExitStatus(1).is_success());
    }

    #[tokio::test]
    async fn test_no_image_fetcher_errors() {
        let image = ImageResource {
            type_: "registry-image".to_string(),
            source: serde_json::json!({"repository": "alpine"}),
            params: None,
            version: None,
        };
        let err = NoImageFetcher
            .fetch_image(&Context::background(), &image, &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::ImageFetch(_)));
    }
}
