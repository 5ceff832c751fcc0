//! The step tree interpreter.
//!
//! A build plan compiles into a tree of [`Step`]s: leaves that do work on
//! workers and combinators that sequence, parallelize, guard or repeat their
//! children. Every step reduces to the same tri-state [`StepResult`]:
//! `Ok(true)` succeeded, `Ok(false)` failed, `Err(_)` errored or was
//! cancelled.

mod artifact;
mod get;
mod hooks;
mod parallel;
mod put;
mod resource;
mod retry;
mod sequence;
mod set_pipeline;
mod task;
mod timeout;
mod try_step;

pub use artifact::{ArtifactInputStep, ArtifactOutputStep};
pub use get::GetStep;
pub use hooks::{EnsureStep, OnAbortStep, OnErrorStep, OnFailureStep, OnSuccessStep};
pub use parallel::{AcrossStep, AggregateStep, InParallelStep};
pub use put::PutStep;
pub use retry::{RetryStep, StepFactory};
pub use sequence::DoStep;
pub use set_pipeline::SetPipelineStep;
pub use task::TaskStep;
pub use timeout::TimeoutStep;
pub use try_step::TryStep;

use async_recursion::async_recursion;
use derive_more::From;
use hangar_core::{Context, StepResult};
use tracing::error;

use crate::delegate::BuildStepDelegate;
use crate::run_state::RunState;

/// One runnable node of a build's step tree.
///
/// Built once per build attempt from a plan node and run at most once.
#[derive(From)]
pub enum Step {
    Task(TaskStep),
    Get(GetStep),
    Put(PutStep),
    SetPipeline(SetPipelineStep),
    ArtifactInput(ArtifactInputStep),
    ArtifactOutput(ArtifactOutputStep),
    Do(DoStep),
    Aggregate(AggregateStep),
    InParallel(InParallelStep),
    Across(AcrossStep),
    OnSuccess(OnSuccessStep),
    OnFailure(OnFailureStep),
    OnAbort(OnAbortStep),
    OnError(OnErrorStep),
    Ensure(EnsureStep),
    Try(TryStep),
    Retry(RetryStep),
    Timeout(TimeoutStep),
}

impl Step {
    #[async_recursion]
    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        match self {
            Step::Task(step) => step.run(ctx, state).await,
            Step::Get(step) => step.run(ctx, state).await,
            Step::Put(step) => step.run(ctx, state).await,
            Step::SetPipeline(step) => step.run(ctx, state).await,
            Step::ArtifactInput(step) => step.run(ctx, state).await,
            Step::ArtifactOutput(step) => step.run(ctx, state).await,
            Step::Do(step) => step.run(ctx, state).await,
            Step::Aggregate(step) => step.run(ctx, state).await,
            Step::InParallel(step) => step.run(ctx, state).await,
            Step::Across(step) => step.run(ctx, state).await,
            Step::OnSuccess(step) => step.run(ctx, state).await,
            Step::OnFailure(step) => step.run(ctx, state).await,
            Step::OnAbort(step) => step.run(ctx, state).await,
            Step::OnError(step) => step.run(ctx, state).await,
            Step::Ensure(step) => step.run(ctx, state).await,
            Step::Try(step) => step.run(ctx, state).await,
            Step::Retry(step) => step.run(ctx, state).await,
            Step::Timeout(step) => step.run(ctx, state).await,
        }
    }

    /// Short name of the step kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Task(_) => "task",
            Step::Get(_) => "get",
            Step::Put(_) => "put",
            Step::SetPipeline(_) => "set_pipeline",
            Step::ArtifactInput(_) => "artifact_input",
            Step::ArtifactOutput(_) => "artifact_output",
            Step::Do(_) => "do",
            Step::Aggregate(_) => "aggregate",
            Step::InParallel(_) => "in_parallel",
            Step::Across(_) => "across",
            Step::OnSuccess(_) => "on_success",
            Step::OnFailure(_) => "on_failure",
            Step::OnAbort(_) => "on_abort",
            Step::OnError(_) => "on_error",
            Step::Ensure(_) => "ensure",
            Step::Try(_) => "try",
            Step::Retry(_) => "retry",
            Step::Timeout(_) => "timeout",
        }
    }
}

/// Report a leaf's non-cancellation error through its delegate.
fn report_errored<D>(delegate: &D, step: &'static str, result: StepResult) -> StepResult
where
    D: BuildStepDelegate + ?Sized,
{
    if let Err(err) = &result {
        if !err.is_cancellation() {
            error!(step, error = %err, "Step errored");
            delegate.errored(&err.to_string());
        }
    }
    result
}
