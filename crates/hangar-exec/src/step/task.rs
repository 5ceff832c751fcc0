use hangar_core::plan::TaskPlan;
use hangar_core::worker::{
    ContainerInput, ContainerKind, ContainerSpec, ImageSource, ImageSpec, ProcessSpec, WorkerSpec,
};
use hangar_core::{BuildInfo, Context, ExecError, PlanId, Result, StepResult};
use std::sync::Arc;
use tracing::{Instrument, debug, info};

use super::report_errored;
use super::resource::{container_owner, process_io};
use crate::delegate::TaskDelegate;
use crate::run_state::{RunState, StepOutput};
use crate::select::SelectionSettings;
use crate::vars;

/// Runs a task process in a container on a worker.
pub struct TaskStep {
    plan_id: PlanId,
    plan: TaskPlan,
    build: BuildInfo,
    settings: SelectionSettings,
    delegate: Arc<dyn TaskDelegate>,
}

impl TaskStep {
    pub fn new(
        plan_id: PlanId,
        plan: TaskPlan,
        build: BuildInfo,
        settings: SelectionSettings,
        delegate: Arc<dyn TaskDelegate>,
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
        let span = self.delegate.start_span("task", &self.plan.name);
        let result = self.run_inner(ctx, state).instrument(span).await;
        report_errored(self.delegate.as_ref(), "task", result)
    }

    async fn run_inner(&self, ctx: &Context, state: &RunState) -> StepResult {
        if let Some(cause) = ctx.cause() {
            return Err(cause.into());
        }

        let delegate = self.delegate.as_ref();
        let config = &self.plan.config;
        delegate.initializing();
        delegate.set_task_config(config);
        config.validate().map_err(ExecError::InvalidTaskConfig)?;

        let inputs = self.resolve_inputs(state)?;
        let image = self.resolve_image(ctx, state).await?;

        let owner = container_owner(&self.build, &self.plan_id);
        let container_spec = ContainerSpec {
            kind: ContainerKind::Task,
            team: self.build.team.clone(),
            image,
            dir: config.run.dir.clone().unwrap_or_else(|| ".".to_string()),
            env: vars::interpolate_map(&config.params, state),
            inputs,
            outputs: config
                .outputs
                .iter()
                .map(|output| (output.name.clone(), output.mount_path().to_string()))
                .collect(),
        };
        let worker_spec = WorkerSpec {
            platform: Some(config.platform.clone()),
            tags: self.plan.tags.clone(),
            resource_type: None,
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

        let process = ProcessSpec {
            path: config.run.path.clone(),
            args: config
                .run
                .args
                .iter()
                .map(|arg| vars::interpolate(arg, state))
                .collect(),
            dir: config.run.dir.clone(),
            user: config.run.user.clone(),
        };

        delegate.starting();
        info!(task = %self.plan.name, worker = %worker.name(), "Running task");
        let outcome = ctx
            .run_until_cancelled(worker.run_task(
                ctx,
                &owner,
                &container_spec,
                &process,
                process_io(delegate),
            ))
            .await?;

        for (output, artifact) in outcome.outputs {
            let name = self
                .plan
                .output_mapping
                .get(&output)
                .cloned()
                .unwrap_or(output);
            debug!(artifact = %name, handle = %artifact, "Registering task output");
            state.store_artifact(name, artifact);
        }

        state.store_result(self.plan_id.clone(), StepOutput::Exit(outcome.exit_status));
        info!(task = %self.plan.name, exit_status = %outcome.exit_status, "Task finished");
        delegate.finished(outcome.exit_status, Some(worker.name()));

        Ok(outcome.exit_status.is_success())
    }

    /// Look up every task input in the build's artifacts, through the input
    /// mapping. Missing optional inputs are skipped.
    fn resolve_inputs(&self, state: &RunState) -> Result<Vec<ContainerInput>> {
        let mut inputs = Vec::new();
        let mut missing = Vec::new();

        for input in &self.plan.config.inputs {
            let source = self
                .plan
                .input_mapping
                .get(&input.name)
                .unwrap_or(&input.name);

            match state.artifact(source) {
                Some(artifact) => inputs.push(ContainerInput {
                    name: input.name.clone(),
                    mount_path: input.mount_path().to_string(),
                    artifact,
                }),
                None if input.optional => {
                    debug!(input = %input.name, "Skipping missing optional input");
                }
                None => missing.push(source.clone()),
            }
        }

        if missing.is_empty() {
            Ok(inputs)
        } else {
            Err(ExecError::MissingInputs(missing))
        }
    }

    async fn resolve_image(&self, ctx: &Context, state: &RunState) -> Result<ImageSpec> {
        let privileged = self.plan.privileged;

        if let Some(name) = &self.plan.image_artifact_name {
            let artifact = state
                .artifact(name)
                .ok_or_else(|| ExecError::MissingArtifact(name.clone()))?;
            return Ok(ImageSpec {
                source: ImageSource::Artifact(artifact),
                privileged,
            });
        }

        if let Some(image) = &self.plan.config.image_resource {
            return ctx
                .run_until_cancelled(self.delegate.fetch_image(
                    ctx,
                    image,
                    &self.plan.resource_types,
                    privileged,
                ))
                .await;
        }

        match &self.plan.config.rootfs_uri {
            Some(uri) => Ok(ImageSpec {
                source: ImageSource::Url(uri.clone()),
                privileged,
            }),
            None => Err(ExecError::InvalidTaskConfig(
                "no image specified".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::World;
    use hangar_core::ArtifactHandle;
    use hangar_core::plan::{ImageResource, TaskInput, TaskOutput};
    use hangar_core::worker::ExitStatus;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_runs_task_and_reports_lifecycle() {
        let world = World::new();
        let result = world.task("A").run(&Context::background(), &world.state()).await;

        assert!(matches!(result, Ok(true)));
        assert_eq!(
            world.delegate("A").events(),
            vec![
                "initializing",
                "task_config",
                "selected_worker:w1",
                "starting",
                "finished:0:w1",
            ]
        );
        assert_eq!(
            world.state().result(&PlanId::from("A")),
            Some(StepOutput::Exit(ExitStatus(0)))
        );
        assert_eq!(world.delegate("A").stdout_contents(), "running A\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let world = World::new();
        world.worker.script_exit("A", 3);

        let result = world.task("A").run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(false)));
        assert_eq!(
            world.state().result(&PlanId::from("A")),
            Some(StepOutput::Exit(ExitStatus(3)))
        );
    }

    #[tokio::test]
    async fn test_inputs_resolve_through_mapping() {
        let world = World::new();
        world
            .state()
            .store_artifact("source-code", ArtifactHandle::on_worker("vol-1", "w1"));

        let mut plan = world.task_plan("build");
        plan.config.inputs = vec![
            TaskInput {
                name: "repo".to_string(),
                path: Some("src".to_string()),
                optional: false,
            },
            TaskInput {
                name: "cache".to_string(),
                path: None,
                optional: true,
            },
        ];
        plan.input_mapping
            .insert("repo".to_string(), "source-code".to_string());

        let result = world.task_from(plan).run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(true)));

        let spec = world.worker.spec_of("build").unwrap();
        assert_eq!(spec.inputs.len(), 1);
        assert_eq!(spec.inputs[0].name, "repo");
        assert_eq!(spec.inputs[0].mount_path, "src");
        assert_eq!(spec.inputs[0].artifact.handle, "vol-1");
    }

    #[tokio::test]
    async fn test_missing_inputs_error_before_selection() {
        let world = World::new();
        let mut plan = world.task_plan("build");
        plan.config.inputs = ["repo", "version"]
            .iter()
            .map(|name| TaskInput {
                name: name.to_string(),
                path: None,
                optional: false,
            })
            .collect();

        let result = world.task_from(plan).run(&Context::background(), &world.state()).await;
        assert!(matches!(
            result,
            Err(ExecError::MissingInputs(ref names)) if names == &["repo", "version"]
        ));
        assert_eq!(world.pool.selections(), 0);
        assert!(world
            .delegate("build")
            .events()
            .contains(&"errored:missing inputs: repo, version".to_string()));
    }

    #[tokio::test]
    async fn test_outputs_registered_under_mapped_names() {
        let world = World::new();
        let mut plan = world.task_plan("build");
        plan.config.outputs = vec![TaskOutput {
            name: "binary".to_string(),
            path: Some("out/bin".to_string()),
        }];
        plan.output_mapping
            .insert("binary".to_string(), "release-binary".to_string());

        let result = world.task_from(plan).run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(true)));

        let state = world.state();
        let artifact = state.artifact("release-binary").unwrap();
        assert_eq!(artifact.worker.as_deref(), Some("w1"));
        assert!(state.artifact("binary").is_none());
        assert_eq!(
            world.worker.spec_of("build").unwrap().outputs["binary"],
            "out/bin"
        );
    }

    #[tokio::test]
    async fn test_invalid_config_errors() {
        let world = World::new();
        let mut plan = world.task_plan("build");
        plan.config.platform.clear();

        let result = world.task_from(plan).run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Err(ExecError::InvalidTaskConfig(_))));
        assert!(world.worker.started().is_empty());
    }

    #[tokio::test]
    async fn test_image_sources() {
        let world = World::new();
        world
            .state()
            .store_artifact("image", ArtifactHandle::on_worker("img-vol", "w1"));

        let mut from_artifact = world.task_plan("from-artifact");
        from_artifact.image_artifact_name = Some("image".to_string());
        from_artifact.privileged = true;

        let mut from_resource = world.task_plan("from-resource");
        from_resource.config.rootfs_uri = None;
        from_resource.config.image_resource = Some(ImageResource {
            type_: "registry-image".to_string(),
            source: json!({"repository": "golang"}),
            params: None,
            version: None,
        });

        let mut no_image = world.task_plan("no-image");
        no_image.config.rootfs_uri = None;

        let state = world.state();
        let ctx = Context::background();
        assert!(matches!(world.task_from(from_artifact).run(&ctx, &state).await, Ok(true)));
        assert!(matches!(world.task_from(from_resource).run(&ctx, &state).await, Ok(true)));
        assert!(matches!(
            world.task_from(no_image).run(&ctx, &state).await,
            Err(ExecError::InvalidTaskConfig(msg)) if msg == "no image specified"
        ));

        let image = world.worker.spec_of("from-artifact").unwrap().image;
        assert!(image.privileged);
        assert!(matches!(image.source, ImageSource::Artifact(a) if a.handle == "img-vol"));
        assert_eq!(
            world.worker.spec_of("from-resource").unwrap().image.source,
            ImageSource::Url("fetched:registry-image".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_image_artifact() {
        let world = World::new();
        let mut plan = world.task_plan("A");
        plan.image_artifact_name = Some("image".to_string());

        let result = world.task_from(plan).run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Err(ExecError::MissingArtifact(name)) if name == "image"));
    }

    #[tokio::test]
    async fn test_params_become_env_with_local_vars() {
        let world = World::new();
        let mut plan = world.task_plan("A");
        plan.config.params = BTreeMap::from([
            ("MODE".to_string(), "release".to_string()),
            ("TARGET".to_string(), "((.:env))".to_string()),
        ]);

        let state = world.state().new_local_scope();
        state.add_local_var("env", json!("prod"));
        let result = world.task_from(plan).run(&Context::background(), &state).await;
        assert!(matches!(result, Ok(true)));

        let env = world.worker.env_of("A");
        assert_eq!(env["MODE"], "release");
        assert_eq!(env["TARGET"], "prod");
    }

    #[tokio::test]
    async fn test_no_worker_work_after_cancellation() {
        let world = World::new();
        let ctx = Context::background();
        ctx.cancel(hangar_core::CancelCause::Abort);

        let result = world.task("A").run(&ctx, &world.state()).await;
        assert!(matches!(result, Err(ExecError::Aborted)));
        assert!(world.delegate("A").events().is_empty());
        assert_eq!(world.pool.selections(), 0);
    }

    #[tokio::test]
    async fn test_worker_selection_uses_task_constraints() {
        let world = World::new();
        let mut plan = world.task_plan("A");
        plan.tags = vec!["gpu".to_string()];

        world.task_from(plan).run(&Context::background(), &world.state()).await.unwrap();
        let request = world.pool.last_request().unwrap();
        assert_eq!(request.platform.as_deref(), Some("linux"));
        assert_eq!(request.tags, vec!["gpu"]);
        assert_eq!(request.team.as_ref().map(|t| t.as_str()), Some("main"));
    }
}
