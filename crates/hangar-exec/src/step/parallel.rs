//! Concurrent execution: aggregate, in_parallel and across.

use futures::stream::{self, StreamExt};
use hangar_core::{Context, ExecError, StepResult};
use serde_json::Value;
use std::future::{Future, ready};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::Step;
use crate::run_state::RunState;

/// Runs every step concurrently and waits for all of them. A failing branch
/// never cancels its siblings.
pub struct AggregateStep {
    steps: Vec<Step>,
}

impl AggregateStep {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        run_concurrently(self.steps.iter().map(|step| step.run(ctx, state)), 0, false).await
    }
}

/// Runs steps concurrently, at most `limit` at a time.
///
/// With `fail_fast`, once a step fails or errors no further steps are
/// started; steps already running are left to finish.
pub struct InParallelStep {
    steps: Vec<Step>,
    limit: usize,
    fail_fast: bool,
}

impl InParallelStep {
    /// `limit` of 0 means unbounded.
    pub fn new(steps: Vec<Step>, limit: usize, fail_fast: bool) -> Self {
        Self {
            steps,
            limit,
            fail_fast,
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        run_concurrently(
            self.steps.iter().map(|step| step.run(ctx, state)),
            self.limit,
            self.fail_fast,
        )
        .await
    }
}

/// Runs one step per value of a variable, each in its own local scope with
/// the variable bound.
pub struct AcrossStep {
    var: String,
    iterations: Vec<(Value, Step)>,
    max_in_flight: usize,
    fail_fast: bool,
}

impl AcrossStep {
    pub fn new(
        var: impl Into<String>,
        iterations: Vec<(Value, Step)>,
        max_in_flight: usize,
        fail_fast: bool,
    ) -> Self {
        Self {
            var: var.into(),
            iterations,
            max_in_flight,
            fail_fast,
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        let var = &self.var;
        let runs = self.iterations.iter().map(|(value, step)| async move {
            let scope = state.new_local_scope();
            scope.add_local_var(var.clone(), value.clone());
            debug!(%var, %value, "Running across iteration");
            step.run(ctx, &scope).await
        });
        run_concurrently(runs, self.max_in_flight, self.fail_fast).await
    }
}

/// Drive `runs` with at most `limit` in flight (0 = all at once).
///
/// Futures are started lazily in order, so with `fail_fast` a failure stops
/// the not-yet-started ones from ever being polled. The result is the AND of
/// every finished run; if any run errored, one error is returned, preferring
/// an abort so cancellation is never masked by a sibling's fault.
async fn run_concurrently<I, F>(runs: I, limit: usize, fail_fast: bool) -> StepResult
where
    I: IntoIterator<Item = F>,
    F: Future<Output = StepResult>,
{
    let runs: Vec<F> = runs.into_iter().collect();
    if runs.is_empty() {
        return Ok(true);
    }
    let limit = if limit == 0 { runs.len() } else { limit };

    let halted = AtomicBool::new(false);
    let halted = &halted;

    let mut results: Vec<(usize, StepResult)> = stream::iter(runs.into_iter().enumerate())
        .take_while(|_| ready(!halted.load(Ordering::SeqCst)))
        .map(|(index, run)| async move {
            let result = run.await;
            if fail_fast && !matches!(result, Ok(true)) {
                halted.store(true, Ordering::SeqCst);
            }
            (index, result)
        })
        .buffer_unordered(limit)
        .collect()
        .await;

    results.sort_by_key(|(index, _)| *index);
    reduce(results.into_iter().map(|(_, result)| result))
}

fn reduce(results: impl Iterator<Item = StepResult>) -> StepResult {
    let mut ok = true;
    let mut error: Option<ExecError> = None;

    for result in results {
        match result {
            Ok(succeeded) => ok &= succeeded,
            Err(err) => {
                ok = false;
                let replace = match &error {
                    None => true,
                    Some(current) => err.is_interrupt() && !current.is_interrupt(),
                };
                if replace {
                    error = Some(err);
                }
            }
        }
    }

    match error {
        Some(err) => Err(err),
        None => Ok(ok),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::World;
    use hangar_core::CancelCause;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_reduce_prefers_abort() {
        let results = vec![
            Ok(true),
            Err(ExecError::Worker("boom".into())),
            Err(ExecError::Aborted),
            Ok(false),
        ];
        assert!(matches!(reduce(results.into_iter()), Err(ExecError::Aborted)));
    }

    #[test]
    fn test_reduce_and_of_outcomes() {
        assert!(matches!(reduce(vec![Ok(true), Ok(true)].into_iter()), Ok(true)));
        assert!(matches!(reduce(vec![Ok(true), Ok(false)].into_iter()), Ok(false)));
        assert!(matches!(
            reduce(
                vec![
                    Err(ExecError::Worker("a".into())),
                    Err(ExecError::Worker("b".into())),
                ]
                .into_iter()
            ),
            Err(ExecError::Worker(msg)) if msg == "a"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_runs_all_concurrently() {
        let world = World::new();
        for name in ["X", "Y", "Z"] {
            world.worker.script_sleep(name, Duration::from_secs(10), 0);
        }
        let step = world.aggregate(vec![world.task("X"), world.task("Y"), world.task("Z")]);

        let started = tokio::time::Instant::now();
        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(true)));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(world.worker.run_count(), 3);
    }

    #[tokio::test]
    async fn test_aggregate_failure_does_not_cancel_siblings() {
        let world = World::new();
        world.worker.script_exit("X", 1);
        world.worker.script_error("Y", "worker lost");
        let step = world.aggregate(vec![world.task("X"), world.task("Y"), world.task("Z")]);

        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Err(ExecError::Worker(_))));
        let mut started = world.worker.started();
        started.sort();
        assert_eq!(started, vec!["X", "Y", "Z"]);
        assert_eq!(world.worker.finished(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_parallel_limit_one_serializes() {
        let world = World::new();
        for name in ["X", "Y", "Z"] {
            world.worker.script_sleep(name, Duration::from_secs(5), 0);
        }
        let step = world.in_parallel(
            vec![world.task("X"), world.task("Y"), world.task("Z")],
            1,
            false,
        );

        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(true)));

        let mut windows = world.worker.windows();
        assert_eq!(windows.len(), 3);
        windows.sort_by_key(|(_, start, _)| *start);
        for pair in windows.windows(2) {
            assert!(pair[0].2 <= pair[1].1, "execution windows overlap: {:?}", pair);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_parallel_respects_limit() {
        let world = World::new();
        let names = ["A", "B", "C", "D", "E"];
        for name in names {
            world.worker.script_sleep(name, Duration::from_secs(1), 0);
        }
        let steps = names.iter().map(|name| world.task(name)).collect();
        let step = world.in_parallel(steps, 2, false);

        let started = tokio::time::Instant::now();
        assert!(matches!(
            step.run(&Context::background(), &world.state()).await,
            Ok(true)
        ));
        assert_eq!(world.worker.max_concurrency(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_parallel_fail_fast_stops_launching() {
        let world = World::new();
        world.worker.script_exit("A", 1);
        world.worker.script_sleep("B", Duration::from_secs(5), 0);
        let step = world.in_parallel(
            vec![world.task("A"), world.task("B"), world.task("C"), world.task("D")],
            2,
            true,
        );

        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(false)));
        // A fails immediately; B was already running and finishes; C and D never start
        let mut started = world.worker.started();
        started.sort();
        assert_eq!(started, vec!["A", "B"]);
        assert_eq!(world.worker.finished(), 2);
    }

    #[tokio::test]
    async fn test_in_parallel_without_fail_fast_runs_everything() {
        let world = World::new();
        world.worker.script_exit("A", 1);
        let step = world.in_parallel(
            vec![world.task("A"), world.task("B"), world.task("C")],
            1,
            false,
        );

        let result = step.run(&Context::background(), &world.state()).await;
        assert!(matches!(result, Ok(false)));
        assert_eq!(world.worker.started(), vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_reaches_every_branch() {
        let world = World::new();
        for name in ["X", "Y"] {
            world.worker.script_hang(name);
        }
        let step = world.aggregate(vec![world.task("X"), world.task("Y")]);
        let ctx = Context::background();
        let state = world.state();

        let (result, _) = tokio::join!(step.run(&ctx, &state), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ctx.cancel(CancelCause::Abort);
        });
        assert!(matches!(result, Err(ExecError::Aborted)));
    }

    #[tokio::test]
    async fn test_across_binds_var_in_isolated_scopes() {
        let world = World::new();
        let step = world.across(
            "env",
            vec![json!("staging"), json!("prod")],
            |value| {
                let mut plan = world.task_plan(&format!("deploy-{}", value.as_str().unwrap()));
                plan.config
                    .params
                    .insert("TARGET".to_string(), "((.:env))".to_string());
                world.task_from(plan)
            },
            1,
            false,
        );

        let state = world.state();
        let result = step.run(&Context::background(), &state).await;
        assert!(matches!(result, Ok(true)));
        assert_eq!(world.worker.started(), vec!["deploy-staging", "deploy-prod"]);
        assert_eq!(
            world.worker.env_of("deploy-prod").get("TARGET").map(String::as_str),
            Some("prod")
        );
        // iteration writes stay in their scopes
        assert!(state.local_var("env").is_none());
    }

    #[tokio::test]
    async fn test_across_fail_fast_skips_remaining_values() {
        let world = World::new();
        world.worker.script_exit("deploy-staging", 1);
        let step = world.across(
            "env",
            vec![json!("staging"), json!("prod"), json!("dr")],
            |value| world.task(&format!("deploy-{}", value.as_str().unwrap())),
            1,
            true,
        );

        let state = world.state();
        let result = step.run(&Context::background(), &state).await;
        assert!(matches!(result, Ok(false)));
        assert_eq!(world.worker.started(), vec!["deploy-staging"]);
        assert!(state.local_var("env").is_none());
    }
}
