use hangar_core::plan::{PutInputs, PutPlan};
use hangar_core::worker::{
    ContainerInput, ContainerKind, ContainerSpec, ResourceRequest, WorkerSpec,
};
use hangar_core::{ArtifactHandle, BuildInfo, Context, ExecError, PlanId, Result, StepResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Instrument, info};

use super::report_errored;
use super::resource::{container_owner, process_io, resource_image};
use crate::delegate::PutDelegate;
use crate::run_state::{RunState, StepOutput};
use crate::select::SelectionSettings;

/// Pushes build artifacts to a resource, producing a new version.
pub struct PutStep {
    plan_id: PlanId,
    plan: PutPlan,
    build: BuildInfo,
    settings: SelectionSettings,
    delegate: Arc<dyn PutDelegate>,
}

impl PutStep {
    pub fn new(
        plan_id: PlanId,
        plan: PutPlan,
        build: BuildInfo,
        settings: SelectionSettings,
        delegate: Arc<dyn PutDelegate>,
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
        let span = self.delegate.start_span("put", &self.plan.name);
        let result = self.run_inner(ctx, state).instrument(span).await;
        report_errored(self.delegate.as_ref(), "put", result)
    }

    async fn run_inner(&self, ctx: &Context, state: &RunState) -> StepResult {
        if let Some(cause) = ctx.cause() {
            return Err(cause.into());
        }

        let delegate = self.delegate.as_ref();
        delegate.initializing();

        let inputs = self.resolve_inputs(state)?;
        let (image, resource_type) =
            resource_image(delegate, ctx, &self.plan.type_, &self.plan.resource_types).await?;

        let owner = container_owner(&self.build, &self.plan_id);
        let container_spec = ContainerSpec {
            kind: ContainerKind::Put,
            team: self.build.team.clone(),
            image,
            dir: ".".to_string(),
            env: BTreeMap::new(),
            inputs,
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
            version: None,
        };

        delegate.starting();
        let outcome = ctx
            .run_until_cancelled(worker.put(
                ctx,
                &owner,
                &container_spec,
                &request,
                process_io(delegate),
            ))
            .await?;

        if outcome.exit_status.is_success() {
            let result = outcome.result.ok_or_else(|| {
                ExecError::Worker(format!("put to '{}' reported no version", self.plan.resource))
            })?;

            info!(
                resource = %self.plan.resource,
                version = ?result.version,
                "Put produced version"
            );
            state.store_result(self.plan_id.clone(), StepOutput::Put(result.clone()));
            delegate.save_output(&self.plan.resource, &result);
        }

        delegate.finished(outcome.exit_status, Some(worker.name()));
        Ok(outcome.exit_status.is_success())
    }

    fn resolve_inputs(&self, state: &RunState) -> Result<Vec<ContainerInput>> {
        let mount = |name: &str, artifact: ArtifactHandle| ContainerInput {
            name: name.to_string(),
            mount_path: name.to_string(),
            artifact,
        };

        match &self.plan.inputs {
            PutInputs::All => Ok(state
                .artifacts()
                .into_iter()
                .map(|(name, artifact)| mount(&name, artifact))
                .collect()),
            PutInputs::Specified(names) => {
                let mut inputs = Vec::new();
                let mut missing = Vec::new();
                for name in names {
                    match state.artifact(name) {
                        Some(artifact) => inputs.push(mount(name, artifact)),
                        None => missing.push(name.clone()),
                    }
                }
                if missing.is_empty() {
                    Ok(inputs)
                } else {
                    Err(ExecError::MissingInputs(missing))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::World;

    #[tokio::test]
    async fn test_put_stores_version_and_saves_output() {
        let world = World::new();
        let result = world.put("release").run(&Context::background(), &world.state()).await;

        assert!(matches!(result, Ok(true)));
        assert!(matches!(
            world.state().result(&PlanId::from("put-release")),
            Some(StepOutput::Put(result)) if result.version == world.worker.put_version()
        ));
        assert!(world
            .delegate("put-release")
            .events()
            .contains(&"save_output:release".to_string()));
    }

    #[tokio::test]
    async fn test_put_sees_all_artifacts_by_default() {
        let world = World::new();
        let state = world.state();
        state.store_artifact("repo", ArtifactHandle::on_worker("v1", "w1"));
        let scoped = state.new_local_scope();
        scoped.store_artifact("binary", ArtifactHandle::on_worker("v2", "w1"));

        world.put("release").run(&Context::background(), &scoped).await.unwrap();

        let names: Vec<String> = world
            .worker
            .spec_of("release")
            .unwrap()
            .inputs
            .into_iter()
            .map(|input| input.name)
            .collect();
        assert_eq!(names, vec!["binary", "repo"]);
    }

    #[tokio::test]
    async fn test_put_specified_inputs() {
        let world = World::new();
        let state = world.state();
        state.store_artifact("repo", ArtifactHandle::on_worker("v1", "w1"));
        state.store_artifact("binary", ArtifactHandle::on_worker("v2", "w1"));

        let mut plan = world.put_plan("release");
        plan.inputs = PutInputs::Specified(vec!["binary".to_string()]);
        world.put_from("put-release", plan).run(&Context::background(), &state).await.unwrap();
        assert_eq!(world.worker.spec_of("release").unwrap().inputs.len(), 1);

        let mut plan = world.put_plan("release");
        plan.inputs = PutInputs::Specified(vec!["binary".to_string(), "docs".to_string()]);
        let result = world
            .put_from("put-release-2", plan)
            .run(&Context::background(), &state)
            .await;
        assert!(matches!(result, Err(ExecError::MissingInputs(names)) if names == vec!["docs"]));
    }

    #[tokio::test]
    async fn test_failed_put_records_nothing() {
        let world = World::new();
        world.worker.script_exit("release", 1);

        let result = world.put("release").run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(false)));
        assert!(world.state().result(&PlanId::from("put-release")).is_none());
    }
}
