use bytes::Bytes;
use hangar_core::pipeline::{PipelineSaver, SetPipelineRequest};
use hangar_core::plan::SetPipelinePlan;
use hangar_core::worker::ExitStatus;
use hangar_core::{BuildInfo, Context, ExecError, PlanId, StepResult};
use std::sync::Arc;
use tracing::{Instrument, info, warn};

use super::report_errored;
use crate::delegate::SetPipelineDelegate;
use crate::run_state::{RunState, StepOutput};

/// Only this team may set pipelines for other teams.
const MAIN_TEAM: &str = "main";

/// Configures a pipeline from a config file inside a build artifact.
pub struct SetPipelineStep {
    plan_id: PlanId,
    plan: SetPipelinePlan,
    build: BuildInfo,
    saver: Arc<dyn PipelineSaver>,
    delegate: Arc<dyn SetPipelineDelegate>,
}

impl SetPipelineStep {
    pub fn new(
        plan_id: PlanId,
        plan: SetPipelinePlan,
        build: BuildInfo,
        saver: Arc<dyn PipelineSaver>,
        delegate: Arc<dyn SetPipelineDelegate>,
    ) -> Self {
        Self {
            plan_id,
            plan,
            build,
            saver,
            delegate,
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        let span = self.delegate.start_span("set_pipeline", &self.plan.name);
        let result = self.run_inner(ctx, state).instrument(span).await;
        report_errored(self.delegate.as_ref(), "set_pipeline", result)
    }

    async fn run_inner(&self, ctx: &Context, state: &RunState) -> StepResult {
        if let Some(cause) = ctx.cause() {
            return Err(cause.into());
        }

        let delegate = self.delegate.as_ref();
        delegate.initializing();

        let (artifact_name, path) = self
            .plan
            .file
            .split_once('/')
            .ok_or_else(|| ExecError::MissingArtifact(self.plan.file.clone()))?;
        let artifact = state
            .artifact(artifact_name)
            .ok_or_else(|| ExecError::MissingArtifact(artifact_name.to_string()))?;

        let team = self
            .plan
            .team
            .clone()
            .unwrap_or_else(|| self.build.team.clone());
        if team != self.build.team && self.build.team.as_str() != MAIN_TEAM {
            warn!(
                team = %team,
                build_team = %self.build.team,
                "Refusing to set another team's pipeline"
            );
            delegate.stderr().write(Bytes::from(format!(
                "only the {} team can set another team's pipeline\n",
                MAIN_TEAM
            )));
            delegate.finished(ExitStatus(1), None);
            return Ok(false);
        }

        delegate.starting();
        let request = SetPipelineRequest {
            team: team.clone(),
            name: self.plan.name.clone(),
            artifact,
            path: path.to_string(),
            vars: self.plan.vars.clone(),
            build_id: self.build.id,
        };
        let changed = ctx
            .run_until_cancelled(self.saver.save(ctx, request))
            .await?;

        info!(team = %team, pipeline = %self.plan.name, changed, "Set pipeline");
        delegate.set_pipeline_changed(&team, &self.plan.name, changed);
        state.store_result(self.plan_id.clone(), StepOutput::PipelineSet { changed });
        delegate.finished(ExitStatus::SUCCESS, None);

        Ok(true)
    }
}
