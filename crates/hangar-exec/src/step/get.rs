use hangar_core::plan::{GetPlan, Version};
use hangar_core::worker::{ContainerKind, ContainerSpec, ResourceRequest, WorkerSpec};
use hangar_core::{BuildInfo, Context, ExecError, PlanId, Result, StepResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Instrument, info};

use super::report_errored;
use super::resource::{container_owner, process_io, resource_image};
use crate::delegate::GetDelegate;
use crate::run_state::{RunState, StepOutput};
use crate::select::SelectionSettings;

/// Fetches a version of a resource into a new artifact.
pub struct GetStep {
    plan_id: PlanId,
    plan: GetPlan,
    build: BuildInfo,
    settings: SelectionSettings,
    delegate: Arc<dyn GetDelegate>,
}

impl GetStep {
    pub fn new(
        plan_id: PlanId,
        plan: GetPlan,
        build: BuildInfo,
        settings: SelectionSettings,
        delegate: Arc<dyn GetDelegate>,
    ) -> Self {
        Self {
            plan_id,
            plan,
            build,
            settings,
            delegate,
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        let span = self.delegate.start_span("get", &self.plan.name);
        let result = self.run_inner(ctx, state).instrument(span).await;
        report_errored(self.delegate.as_ref(), "get", result)
    }

    async fn run_inner(&self, ctx: &Context, state: &RunState) -> StepResult {
        if let Some(cause) = ctx.cause() {
            return Err(cause.into());
        }

        let delegate = self.delegate.as_ref();
        delegate.initializing();

        let version = self.resolve_version(state)?;
        let (image, resource_type) =
            resource_image(delegate, ctx, &self.plan.type_, &self.plan.resource_types).await?;

        let owner = container_owner(&self.build, &self.plan_id);
        let container_spec = ContainerSpec {
            kind: ContainerKind::Get,
            team: self.build.team.clone(),
            image,
            dir: ".".to_string(),
            env: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: BTreeMap::new(),
        };
        let worker_spec = WorkerSpec {
            platform: None,
            tags: self.plan.tags.clone(),
            resource_type,
            team: Some(self.build.team.clone()),
        };

        let worker = delegate
            .select_worker(
                ctx,
                state.pool().as_ref(),
                &owner,
                &container_spec,
                &worker_spec,
                self.settings.strategy,
                self.settings.create_timeout,
                self.settings.wait_timeout,
            )
            .await?;
        delegate.selected_worker(worker.name());

        let request = ResourceRequest {
            resource: self.plan.resource.clone(),
            type_: self.plan.type_.clone(),
            source: self.plan.source.clone(),
            params: self.plan.params.clone(),
            version,
        };

        delegate.starting();
        let outcome = ctx
            .run_until_cancelled(worker.fetch(
                ctx,
                &owner,
                &container_spec,
                &request,
                process_io(delegate),
            ))
            .await?;

        if outcome.exit_status.is_success() {
            let artifact = outcome.artifact.ok_or_else(|| {
                ExecError::Worker(format!("get of '{}' produced no artifact", self.plan.resource))
            })?;
            let result = outcome.result.ok_or_else(|| {
                ExecError::Worker(format!("get of '{}' reported no version", self.plan.resource))
            })?;

            info!(resource = %self.plan.resource, version = ?result.version, "Fetched version");
            state.store_artifact(self.plan.name.clone(), artifact);
            state.store_result(self.plan_id.clone(), StepOutput::Fetched(result.clone()));
            delegate.update_version(&self.plan.resource, &result);
        }

        delegate.finished(outcome.exit_status, Some(worker.name()));
        Ok(outcome.exit_status.is_success())
    }

    /// The pinned version, or the one an earlier get or put of this build
    /// produced. `None` fetches the latest.
    fn resolve_version(&self, state: &RunState) -> Result<Option<Version>> {
        if let Some(version) = &self.plan.version {
            return Ok(Some(version.clone()));
        }

        let Some(from) = &self.plan.version_from else {
            return Ok(None);
        };
        match state.result(from) {
            Some(StepOutput::Put(result)) | Some(StepOutput::Fetched(result)) => {
                Ok(Some(result.version))
            }
            _ => Err(ExecError::VersionNotFound(from.to_string())),
        }
    }
}
