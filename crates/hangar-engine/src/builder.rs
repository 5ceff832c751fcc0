//! Compiles a build plan into a step tree.

use hangar_core::pipeline::PipelineSaver;
use hangar_core::BuildInfo;
use hangar_core::plan::{Plan, PlanKind};
use hangar_exec::step::{
    AcrossStep, AggregateStep, ArtifactInputStep, ArtifactOutputStep, DoStep, EnsureStep,
    GetStep, InParallelStep, OnAbortStep, OnErrorStep, OnFailureStep, OnSuccessStep, PutStep,
    RetryStep, SetPipelineStep, TaskStep, TimeoutStep, TryStep,
};
use hangar_exec::{DelegateFactory, SelectionSettings, Step, StepFactory};
use std::sync::Arc;

/// Everything needed to turn plan nodes of one build into steps.
#[derive(Clone)]
pub struct StepBuilder {
    build: BuildInfo,
    delegates: Arc<dyn DelegateFactory>,
    pipelines: Arc<dyn PipelineSaver>,
    settings: SelectionSettings,
}

impl StepBuilder {
    pub fn new(
        build: BuildInfo,
        delegates: Arc<dyn DelegateFactory>,
        pipelines: Arc<dyn PipelineSaver>,
        settings: SelectionSettings,
    ) -> Self {
        Self {
            build,
            delegates,
            pipelines,
            settings,
        }
    }

    pub fn build(&self, plan: &Plan) -> Step {
        let id = &plan.id;
        match &plan.kind {
            PlanKind::Task(task) => Step::Task(TaskStep::new(
                id.clone(),
                task.clone(),
                self.build.clone(),
                self.settings,
                self.delegates.task_delegate(&self.build, id),
            )),
            PlanKind::Get(get) => Step::Get(GetStep::new(
                id.clone(),
                get.clone(),
                self.build.clone(),
                self.settings,
                self.delegates.get_delegate(&self.build, id),
            )),
            PlanKind::Put(put) => Step::Put(PutStep::new(
                id.clone(),
                put.clone(),
                self.build.clone(),
                self.settings,
                self.delegates.put_delegate(&self.build, id),
            )),
            PlanKind::SetPipeline(set) => Step::SetPipeline(SetPipelineStep::new(
                id.clone(),
                set.clone(),
                self.build.clone(),
                self.pipelines.clone(),
                self.delegates.set_pipeline_delegate(&self.build, id),
            )),
            PlanKind::ArtifactInput(input) => {
                Step::ArtifactInput(ArtifactInputStep::new(id.clone(), input.clone()))
            }
            PlanKind::ArtifactOutput(output) => {
                Step::ArtifactOutput(ArtifactOutputStep::new(id.clone(), output.clone()))
            }
            PlanKind::Do(plans) => Step::Do(DoStep::new(self.build_all(plans))),
            PlanKind::Aggregate(plans) => {
                Step::Aggregate(AggregateStep::new(self.build_all(plans)))
            }
            PlanKind::InParallel(parallel) => Step::InParallel(InParallelStep::new(
                self.build_all(&parallel.steps),
                parallel.limit,
                parallel.fail_fast,
            )),
            PlanKind::Across(across) => {
                let iterations = across
                    .values
                    .iter()
                    .map(|value| (value.clone(), self.build(&across.step)))
                    .collect();
                Step::Across(AcrossStep::new(
                    across.var.clone(),
                    iterations,
                    across.max_in_flight,
                    across.fail_fast,
                ))
            }
            PlanKind::OnSuccess(hook) => Step::OnSuccess(OnSuccessStep::new(
                self.build(&hook.step),
                self.build(&hook.hook),
            )),
            PlanKind::OnFailure(hook) => Step::OnFailure(OnFailureStep::new(
                self.build(&hook.step),
                self.build(&hook.hook),
            )),
            PlanKind::OnAbort(hook) => Step::OnAbort(OnAbortStep::new(
                self.build(&hook.step),
                self.build(&hook.hook),
            )),
            PlanKind::OnError(hook) => Step::OnError(OnErrorStep::new(
                self.build(&hook.step),
                self.build(&hook.hook),
            )),
            PlanKind::Ensure(hook) => Step::Ensure(EnsureStep::new(
                self.build(&hook.step),
                self.build(&hook.hook),
            )),
            PlanKind::Try(inner) => Step::Try(TryStep::new(self.build(inner))),
            PlanKind::Retry(retry) => {
                let builder = self.clone();
                let plan = retry.step.as_ref().clone();
                let factory: StepFactory = Box::new(move |_attempt| builder.build(&plan));
                Step::Retry(RetryStep::new(factory, retry.attempts))
            }
            PlanKind::Timeout(timeout) => {
                Step::Timeout(TimeoutStep::new(self.build(&timeout.step), timeout.duration))
            }
        }
    }

    fn build_all(&self, plans: &[Plan]) -> Vec<Step> {
        plans.iter().map(|plan| self.build(plan)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::plan::{ArtifactOutputPlan, HookPlan, RetryPlan, TimeoutPlan};
    use hangar_core::Context;
    use hangar_exec::testing::{
        FakePipelineSaver, FakePool, FakeWorker, RecordingDelegateFactory, task_plan,
    };
    use hangar_exec::RunState;
    use std::time::Duration;

    fn task(id: &str, name: &str) -> Plan {
        Plan::new(id, PlanKind::Task(task_plan(name)))
    }

    fn builder(delegates: Arc<RecordingDelegateFactory>) -> StepBuilder {
        StepBuilder::new(
            BuildInfo::one_off("main", "b1"),
            delegates,
            Arc::new(FakePipelineSaver::default()),
            SelectionSettings::default(),
        )
    }

    #[test]
    fn test_builds_matching_variants() {
        let delegates = Arc::new(RecordingDelegateFactory::default());
        let plan = Plan::new(
            "1",
            PlanKind::Ensure(HookPlan {
                step: Box::new(Plan::new(
                    "2",
                    PlanKind::Timeout(TimeoutPlan {
                        step: Box::new(task("3", "A")),
                        duration: Duration::from_secs(60),
                    }),
                )),
                hook: Box::new(Plan::new(
                    "4",
                    PlanKind::ArtifactOutput(ArtifactOutputPlan {
                        name: "A".to_string(),
                    }),
                )),
            }),
        );

        let step = builder(delegates).build(&plan);
        assert_eq!(step.kind(), "ensure");
    }

    #[tokio::test]
    async fn test_leaf_delegates_follow_plan_ids() {
        let delegates = Arc::new(RecordingDelegateFactory::default());
        let worker = Arc::new(FakeWorker::new("w1"));
        let pool = Arc::new(FakePool::with_worker(worker.clone()));
        let plan = Plan::new("1", PlanKind::Do(vec![task("2", "A"), task("3", "B")]));

        let step = builder(delegates.clone()).build(&plan);
        let result = step.run(&Context::background(), &RunState::new(pool)).await;

        assert!(matches!(result, Ok(true)));
        assert_eq!(worker.started(), vec!["A", "B"]);
        assert!(delegates.delegate(&"2".into()).events().contains(&"starting".to_string()));
        assert!(delegates.delegate(&"3".into()).events().contains(&"starting".to_string()));
    }

    #[tokio::test]
    async fn test_retry_builds_a_fresh_tree_per_attempt() {
        let delegates = Arc::new(RecordingDelegateFactory::default());
        let worker = Arc::new(FakeWorker::new("w1"));
        worker.script_error("flaky", "connection reset");
        worker.script_exit("flaky", 0);
        let pool = Arc::new(FakePool::with_worker(worker.clone()));

        let plan = Plan::new(
            "1",
            PlanKind::Retry(RetryPlan {
                step: Box::new(task("2", "flaky")),
                attempts: 3,
            }),
        );
        let step = builder(delegates).build(&plan);
        let result = step.run(&Context::background(), &RunState::new(pool)).await;

        assert!(matches!(result, Ok(true)));
        assert_eq!(worker.run_count(), 2);
        let Step::Retry(retry) = &step else {
            panic!("expected retry step");
        };
        assert_eq!(retry.attempts(), 2);
    }
}
