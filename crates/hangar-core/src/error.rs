//! Error types for build step execution.

use thiserror::Error;

use crate::context::CancelCause;

/// A system or infrastructure fault raised while running a step.
///
/// A step that merely fails (non-zero exit, failed check) is not an error:
/// it returns `Ok(false)`. Cancellations are errors that carry their cause.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("build aborted")]
    Aborted,

    #[error("deadline exceeded")]
    TimedOut,

    #[error("interrupted by engine shutdown")]
    Interrupted,

    #[error("no eligible worker: {0}")]
    NoEligibleWorker(String),

    #[error("worker selection failed: {0}")]
    WorkerSelection(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("failed to fetch image: {0}")]
    ImageFetch(String),

    #[error("missing inputs: {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    #[error("unknown artifact source: {0}")]
    MissingArtifact(String),

    #[error("invalid task configuration: {0}")]
    InvalidTaskConfig(String),

    #[error("version not found for plan {0}")]
    VersionNotFound(String),

    #[error("failed to save pipeline: {0}")]
    PipelineSave(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// The cancellation cause behind this error, if it is a cancellation.
    pub fn cancel_cause(&self) -> Option<CancelCause> {
        match self {
            ExecError::Aborted => Some(CancelCause::Abort),
            ExecError::TimedOut => Some(CancelCause::Timeout),
            ExecError::Interrupted => Some(CancelCause::Shutdown),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.cancel_cause().is_some()
    }

    /// True only for operator aborts. Timeouts and shutdowns are not aborts.
    pub fn is_abort(&self) -> bool {
        matches!(self, ExecError::Aborted)
    }

    /// Errors that must never be swallowed or retried: aborts and engine shutdown.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, ExecError::Aborted | ExecError::Interrupted)
    }
}

impl From<CancelCause> for ExecError {
    fn from(cause: CancelCause) -> Self {
        match cause {
            CancelCause::Abort => ExecError::Aborted,
            CancelCause::Timeout => ExecError::TimedOut,
            CancelCause::Shutdown => ExecError::Interrupted,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Tri-state outcome of running a step: `Ok(true)` succeeded, `Ok(false)`
/// failed, `Err(_)` errored or was cancelled.
pub type StepResult = Result<bool>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_causes_roundtrip() {
        for cause in [CancelCause::Abort, CancelCause::Timeout, CancelCause::Shutdown] {
            assert_eq!(ExecError::from(cause).cancel_cause(), Some(cause));
        }
    }

    #[test]
    fn test_only_abort_is_abort() {
        assert!(ExecError::Aborted.is_abort());
        assert!(!ExecError::TimedOut.is_abort());
        assert!(!ExecError::Interrupted.is_abort());
        assert!(ExecError::Interrupted.is_interrupt());
        assert!(!ExecError::TimedOut.is_interrupt());
        assert!(!ExecError::Worker("boom".into()).is_cancellation());
    }

    #[test]
    fn test_missing_inputs_message() {
        let err = ExecError::MissingInputs(vec!["repo".into(), "version".into()]);
        assert_eq!(err.to_string(), "missing inputs: repo, version");
    }
}
