//! Hook combinators: run a second step depending on how the first ended.

use hangar_core::{Context, StepResult};
use tracing::{debug, warn};

use super::Step;
use crate::run_state::RunState;

/// The context a hook runs under once its primary step is done.
///
/// A cancelled context would stop the hook before it starts, so cleanup after
/// an abort or timeout runs detached from it.
fn hook_context(ctx: &Context) -> Context {
    if ctx.is_cancelled() {
        Context::background()
    } else {
        ctx.clone()
    }
}

/// Runs `hook` only after `step` succeeded; the hook's result is the result.
pub struct OnSuccessStep {
    step: Box<Step>,
    hook: Box<Step>,
}

impl OnSuccessStep {
    pub fn new(step: Step, hook: Step) -> Self {
        Self {
            step: Box::new(step),
            hook: Box::new(hook),
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        if !self.step.run(ctx, state).await? {
            return Ok(false);
        }
        self.hook.run(ctx, state).await
    }
}

/// Runs `hook` only after `step` failed. The build still fails; a hook error
/// replaces the failure.
pub struct OnFailureStep {
    step: Box<Step>,
    hook: Box<Step>,
}

impl OnFailureStep {
    pub fn new(step: Step, hook: Step) -> Self {
        Self {
            step: Box::new(step),
            hook: Box::new(hook),
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        let ok = self.step.run(ctx, state).await?;
        if !ok {
            self.hook.run(ctx, state).await?;
        }
        Ok(ok)
    }
}

/// Runs `hook` when `step` was aborted by an operator. Timeouts and engine
/// shutdown do not count. The abort always propagates.
pub struct OnAbortStep {
    step: Box<Step>,
    hook: Box<Step>,
}

impl OnAbortStep {
    pub fn new(step: Step, hook: Step) -> Self {
        Self {
            step: Box::new(step),
            hook: Box::new(hook),
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        let result = self.step.run(ctx, state).await;
        if let Err(err) = &result {
            if err.is_abort() {
                debug!("Running on_abort hook");
                if let Err(hook_err) = self.hook.run(&Context::background(), state).await {
                    warn!(error = %hook_err, "on_abort hook errored");
                }
            }
        }
        result
    }
}

/// Runs `hook` when `step` errored for any reason other than an abort or
/// shutdown. The hook's outcome is ignored.
pub struct OnErrorStep {
    step: Box<Step>,
    hook: Box<Step>,
}

impl OnErrorStep {
    pub fn new(step: Step, hook: Step) -> Self {
        Self {
            step: Box::new(step),
            hook: Box::new(hook),
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        let result = self.step.run(ctx, state).await;
        if let Err(err) = &result {
            if !err.is_interrupt() {
                debug!(error = %err, "Running on_error hook");
                if let Err(hook_err) = self.hook.run(&hook_context(ctx), state).await {
                    warn!(error = %hook_err, "on_error hook errored");
                }
            }
        }
        result
    }
}

/// Always runs `hook` after `step`.
///
/// A step error wins over a hook error; otherwise the result is the AND of
/// both outcomes.
pub struct EnsureStep {
    step: Box<Step>,
    hook: Box<Step>,
}

impl EnsureStep {
    pub fn new(step: Step, hook: Step) -> Self {
        Self {
            step: Box::new(step),
            hook: Box::new(hook),
        }
    }

    pub async fn run(&self, ctx: &Context, state: &RunState) -> StepResult {
        let result = self.step.run(ctx, state).await;
        let hook_result = self.hook.run(&hook_context(ctx), state).await;

        match (result, hook_result) {
            (Err(err), hook_result) => {
                if let Err(hook_err) = hook_result {
                    warn!(error = %hook_err, "ensure hook errored after step error");
                }
                Err(err)
            }
            (Ok(_), Err(hook_err)) => Err(hook_err),
            (Ok(ok), Ok(hook_ok)) => Ok(ok && hook_ok),
        }
    }
}
