use hangar_core::{Context, ExecError, StepResult};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, warn};

use super::Step;
use crate::run_state::RunState;

/// Builds the step for one attempt, numbered from 1.
pub type StepFactory = Box<dyn Fn(u32) -> Step + Send + Sync>;

/// Re-runs a step while it errors, up to a number of attempts.
///
/// A plain failure is final; only errors are retried. Every attempt gets a
/// freshly built step. Aborts and shutdown stop retrying at once.
pub struct RetryStep {
    factory: StepFactory,
    max_attempts: u32,
    attempts: AtomicU32,
}

impl RetryStep {
    pub fn new(factory: StepFactory, max_attempts: u32) -> Self {
        Self {
            factory,
            max_attempts: max_attempts.max(1),
            attempts: AtomicU32::new(0),
        }
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        let mut last_error: Option<ExecError> = None;

        for attempt in 1..=self.max_attempts {
            self.attempts.store(attempt, Ordering::SeqCst);
            let step = (self.factory)(attempt);

            match step.run(ctx, state).await {
                Ok(ok) => return Ok(ok),
                Err(err) if err.is_interrupt() || ctx.is_cancelled() => return Err(err),
                Err(err) => {
                    if attempt < self.max_attempts {
                        warn!(
                            attempt,
                            max_attempts = self.max_attempts,
                            error = %err,
                            "Attempt errored, retrying"
                        );
                    }
                    last_error = Some(err);
                }
            }
        }

        info!(attempts = self.max_attempts, "All attempts errored");
        Err(last_error.unwrap_or_else(|| ExecError::Internal("retry ran no attempts".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::World;
    use hangar_core::CancelCause;
    use std::time::Duration;

    #[tokio::test]
    async fn test_succeeds_on_last_attempt() {
        let world = World::new();
        world.worker.script_error("A", "flaky");
        world.worker.script_error("A", "flaky");
        world.worker.script_exit("A", 0);

        let step = world.retry("A", 3);
        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(true)));
        assert_eq!(world.worker.run_count(), 3);
        let Step::Retry(retry) = &step else {
            panic!("expected retry step");
        };
        assert_eq!(retry.attempts(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_last_error() {
        let world = World::new();
        world.worker.script_error("A", "first");
        world.worker.script_error("A", "second");
        world.worker.script_error("A", "last");

        let step = world.retry("A", 2);
        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Err(ExecError::Worker(msg)) if msg == "second"));
        assert_eq!(world.worker.run_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_retried() {
        let world = World::new();
        world.worker.script_exit("A", 1);

        let step = world.retry("A", 5);
        assert!(matches!(
            step.run(&Context::background(), &world.state()).await,
            Ok(false)
        ));
        assert_eq!(world.worker.run_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_retrying() {
        let world = World::new();
        world.worker.script_hang("A");

        let step = world.retry("A", 5);
        let ctx = Context::background();
        let state = world.state();
        let (result, _) = tokio::join!(step.run(&ctx, &state), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ctx.cancel(CancelCause::Abort);
        });

        assert!(matches!(result, Err(ExecError::Aborted)));
        assert_eq!(world.worker.started(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let world = World::new();
        let step = world.retry("A", 0);
        assert!(matches!(
            step.run(&Context::background(), &world.state()).await,
            Ok(true)
        ));
        assert_eq!(world.worker.run_count(), 1);
    }
}
