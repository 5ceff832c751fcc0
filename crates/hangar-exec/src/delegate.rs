//! Delegates: the callback surface leaf steps report through.
//!
//! Delegates are implemented by the surrounding build machinery (event
//! streams, persistence). Steps never talk to storage directly.

use async_trait::async_trait;
use hangar_core::plan::{ImageResource, TaskConfig, VersionedResourceType};
use hangar_core::worker::{
    ContainerOwner, ContainerSpec, ExitStatus, ImageSpec, LogSink, PlacementStrategy,
    VersionResult, WorkerClient, WorkerPool, WorkerSpec,
};
use hangar_core::{BuildInfo, Context, PlanId, Result, TeamName};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

use crate::select;

/// Lifecycle and resource callbacks shared by every leaf step.
#[async_trait]
pub trait BuildStepDelegate: Send + Sync {
    fn initializing(&self);

    fn starting(&self);

    fn finished(&self, status: ExitStatus, worker: Option<&str>);

    fn errored(&self, message: &str);

    fn selected_worker(&self, name: &str);

    fn stdout(&self) -> Arc<dyn LogSink>;

    fn stderr(&self) -> Arc<dyn LogSink>;

    /// Span the step's work runs inside.
    fn start_span(&self, step: &'static str, name: &str) -> Span;

    async fn fetch_image(
        &self,
        ctx: &Context,
        image: &ImageResource,
        resource_types: &[VersionedResourceType],
        privileged: bool,
    ) -> Result<ImageSpec>;

    /// Choose a worker for a container. The default waits for an eligible
    /// worker for at most `wait_timeout`, announcing the wait on stderr.
    #[allow(clippy::too_many_arguments)]
    async fn select_worker(
        &self,
        ctx: &Context,
        pool: &dyn WorkerPool,
        owner: &ContainerOwner,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        strategy: PlacementStrategy,
        create_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Arc<dyn WorkerClient>> {
        let stderr = self.stderr();
        select::select_worker(
            ctx,
            pool,
            owner,
            container_spec,
            worker_spec,
            strategy,
            create_timeout,
            wait_timeout,
            Some(stderr.as_ref()),
        )
        .await
    }
}

pub trait TaskDelegate: BuildStepDelegate {
    fn set_task_config(&self, config: &TaskConfig);
}

pub trait GetDelegate: BuildStepDelegate {
    fn update_version(&self, resource: &str, result: &VersionResult);
}

pub trait PutDelegate: BuildStepDelegate {
    fn save_output(&self, resource: &str, result: &VersionResult);
}

pub trait SetPipelineDelegate: BuildStepDelegate {
    fn set_pipeline_changed(&self, team: &TeamName, name: &str, changed: bool);
}

/// Creates one delegate per leaf plan node.
pub trait DelegateFactory: Send + Sync {
    fn task_delegate(&self, build: &BuildInfo, plan_id: &PlanId) -> Arc<dyn TaskDelegate>;

    fn get_delegate(&self, build: &BuildInfo, plan_id: &PlanId) -> Arc<dyn GetDelegate>;

    fn put_delegate(&self, build: &BuildInfo, plan_id: &PlanId) -> Arc<dyn PutDelegate>;

    fn set_pipeline_delegate(
        &self,
        build: &BuildInfo,
        plan_id: &PlanId,
    ) -> Arc<dyn SetPipelineDelegate>;
}
