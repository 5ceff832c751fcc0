use hangar_core::plan::{ArtifactInputPlan, ArtifactOutputPlan};
use hangar_core::{ArtifactHandle, Context, ExecError, PlanId, StepResult};
use tracing::debug;

use crate::run_state::{RunState, StepOutput};

/// Registers an artifact that exists outside any worker, such as inputs
/// uploaded with a one-off build.
pub struct ArtifactInputStep {
    plan_id: PlanId,
    plan: ArtifactInputPlan,
}

impl ArtifactInputStep {
    pub fn new(plan_id: PlanId, plan: ArtifactInputPlan) -> Self {
        Self { plan_id, plan }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        if let Some(cause) = ctx.cause() {
            return Err(cause.into());
        }

        debug!(
            plan_id = %self.plan_id,
            artifact = %self.plan.name,
            handle = %self.plan.handle,
            "Registering artifact input"
        );
        state.store_artifact(
            self.plan.name.clone(),
            ArtifactHandle::detached(self.plan.handle.clone()),
        );
        Ok(true)
    }
}

/// Records an artifact as an output of the build.
pub struct ArtifactOutputStep {
    plan_id: PlanId,
    plan: ArtifactOutputPlan,
}

impl ArtifactOutputStep {
    pub fn new(plan_id: PlanId, plan: ArtifactOutputPlan) -> Self {
        Self { plan_id, plan }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        if let Some(cause) = ctx.cause() {
            return Err(cause.into());
        }

        let artifact = state
            .artifact(&self.plan.name)
            .ok_or_else(|| ExecError::MissingArtifact(self.plan.name.clone()))?;

        debug!(
            plan_id = %self.plan_id,
            artifact = %self.plan.name,
            handle = %artifact,
            "Recording artifact output"
        );
        state.store_result(self.plan_id.clone(), StepOutput::Artifact(artifact));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::World;

    #[tokio::test]
    async fn test_input_then_output() {
        let world = World::new();
        let state = world.state();
        let ctx = Context::background();

        let step = world.do_(vec![
            world.artifact_input("uploads", "blob-123"),
            world.artifact_output("uploads"),
        ]);
        assert!(matches!(step.run(&ctx, &state).await, Ok(true)));

        assert!(state.artifact("uploads").unwrap().worker.is_none());
        assert!(matches!(
            state.result(&PlanId::from("output-uploads")),
            Some(StepOutput::Artifact(artifact)) if artifact.handle == "blob-123"
        ));
    }

    #[tokio::test]
    async fn test_output_of_unknown_artifact() {
        let world = World::new();
        let result = world
            .artifact_output("missing")
            .run(&Context::background(), &world.state())
            .await;
        assert!(matches!(result, Err(ExecError::MissingArtifact(name)) if name == "missing"));
    }
}
