use hangar_core::{Context, StepResult};
use tracing::warn;

use super::Step;
use crate::run_state::RunState;

/// Runs a step and swallows its errors: anything but success is a plain
/// failure. Aborts and engine shutdown still propagate.
pub struct TryStep {
    step: Box<Step>,
}

impl TryStep {
    pub fn new(step: Step) -> Self {
        Self {
            step: Box::new(step),
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        match self.step.run(ctx, state).await {
            Ok(ok) => Ok(ok),
            Err(err) if err.is_interrupt() => Err(err),
            Err(err) => {
                warn!(error = %err, "Ignoring error inside try");
                Ok(false)
            }
        }
    }
}
