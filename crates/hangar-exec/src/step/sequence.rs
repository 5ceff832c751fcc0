//! Sequential execution.

use hangar_core::{Context, StepResult};

use super::Step;
use crate::run_state::RunState;

/// Runs its steps in order, stopping at the first that fails or errors.
pub struct DoStep {
    steps: Vec<Step>,
}

impl DoStep {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        for step in &self.steps {
            if !step.run(ctx, state).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::World;
    use hangar_core::{Context, ExecError};

    #[tokio::test]
    async fn test_runs_all_steps_in_order() {
        let world = World::new();
        let step = world.do_(vec![world.task("A"), world.task("B"), world.task("C")]);

        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(true)));
        assert_eq!(world.worker.started(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_stops_after_failure() {
        let world = World::new();
        world.worker.script_exit("B", 2);
        let step = world.do_(vec![world.task("A"), world.task("B"), world.task("C")]);

        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(false)));
        assert_eq!(world.worker.started(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_stops_after_error() {
        let world = World::new();
        world.worker.script_error("A", "container vanished");
        let step = world.do_(vec![world.task("A"), world.task("B")]);

        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Err(ExecError::Worker(_))));
        assert_eq!(world.worker.started(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_empty_do_succeeds() {
        let world = World::new();
        let step = world.do_(vec![]);
        assert!(matches!(
            step.run(&Context::background(), &world.state()).await,
            Ok(true)
        ));
    }
}
