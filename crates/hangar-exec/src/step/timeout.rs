use hangar_core::{Context, ExecError, StepResult};
use std::time::Duration;
use tracing::info;

use super::Step;
use crate::run_state::RunState;

/// Bounds a step's run time.
///
/// Steps inside see a `Timeout` cancellation when the duration passes. The
/// expiry itself is reported as a failure, so failure hooks around this step
/// still fire. Cancellation from outside propagates unchanged.
pub struct TimeoutStep {
    step: Box<Step>,
    duration: Duration,
}

impl TimeoutStep {
    pub fn new(step: Step, duration: Duration) -> Self {
        Self {
            step: Box::new(step),
            duration,
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        let bounded = ctx.with_timeout(self.duration);
        match self.step.run(&bounded, state).await {
            Err(ExecError::TimedOut) if ctx.cause().is_none() => {
                info!(duration = ?self.duration, "Step timed out");
                Ok(false)
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::World;
    use hangar_core::CancelCause;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_a_failure() {
        let world = World::new();
        world.worker.script_hang("A");
        let step = world.timeout(world.task("A"), Duration::from_secs(30));

        let started = tokio::time::Instant::now();
        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(false)));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_step_is_unaffected() {
        let world = World::new();
        world.worker.script_sleep("A", Duration::from_secs(1), 0);
        let step = world.timeout(world.task("A"), Duration::from_secs(30));

        assert!(matches!(
            step.run(&Context::background(), &world.state()).await,
            Ok(true)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outer_timeout_propagates() {
        let world = World::new();
        world.worker.script_hang("A");
        let step = world.timeout(world.task("A"), Duration::from_secs(30));

        let outer = Context::background().with_timeout(Duration::from_secs(5));
        let result = step.run(&outer, &world.state()).await;
        assert!(matches!(result, Err(ExecError::TimedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_failure_fires_after_timeout() {
        let world = World::new();
        world.worker.script_hang("A");
        let step = world.on_failure(
            world.timeout(world.task("A"), Duration::from_secs(1)),
            world.task("notify"),
        );

        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(false)));
        assert_eq!(world.worker.started(), vec!["A", "notify"]);
    }

    #[tokio::test]
    async fn test_abort_propagates() {
        let world = World::new();
        let ctx = Context::background();
        ctx.cancel(CancelCause::Abort);

        let step = world.timeout(world.task("A"), Duration::from_secs(30));
        assert!(matches!(
            step.run(&ctx, &world.state()).await,
            Err(ExecError::Aborted)
        ));
    }
}
