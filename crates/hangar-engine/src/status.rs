//! Final build status.

use derive_more::Display;
use hangar_core::{CancelCause, StepResult};
use serde::{Deserialize, Serialize};

/// Terminal status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    #[display("errored")]
    Errored,
    #[display("aborted")]
    Aborted,
}

/// What running a build amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The build reached a terminal status.
    Finished(BuildStatus),
    /// The engine drained before the build finished. The build has no status
    /// yet and can be run again by whoever owns it.
    Interrupted,
}

impl RunOutcome {
    /// Map a step tree's result to an outcome.
    pub fn from_result(result: &StepResult) -> Self {
        match result {
            Ok(true) => RunOutcome::Finished(BuildStatus::Succeeded),
            Ok(false) => RunOutcome::Finished(BuildStatus::Failed),
            Err(err) => match err.cancel_cause() {
                Some(CancelCause::Abort) => RunOutcome::Finished(BuildStatus::Aborted),
                Some(CancelCause::Shutdown) => RunOutcome::Interrupted,
                Some(CancelCause::Timeout) | None => RunOutcome::Finished(BuildStatus::Errored),
            },
        }
    }

    pub fn status(&self) -> Option<BuildStatus> {
        match self {
            RunOutcome::Finished(status) => Some(*status),
            RunOutcome::Interrupted => None,
        }
    }
}
