//! Build events emitted by the default delegates.

use chrono::{DateTime, Utc};
use hangar_core::plan::TaskConfig;
use hangar_core::worker::{ExitStatus, VersionResult};
use hangar_core::{BuildId, PlanId, TeamName};
use serde::{Deserialize, Serialize};

/// Which output stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Something that happened to one step of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEventKind {
    Initializing,
    Starting,
    Finished {
        exit_status: ExitStatus,
        worker: Option<String>,
    },
    Errored {
        message: String,
    },
    SelectedWorker {
        worker: String,
    },
    Log {
        stream: LogStream,
        payload: String,
    },
    TaskConfig {
        config: Box<TaskConfig>,
    },
    VersionUpdated {
        resource: String,
        result: VersionResult,
    },
    OutputSaved {
        resource: String,
        result: VersionResult,
    },
    PipelineChanged {
        team: TeamName,
        name: String,
        changed: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub time: DateTime<Utc>,
    pub build_id: BuildId,
    pub plan_id: PlanId,
    #[serde(flatten)]
    pub kind: BuildEventKind,
}

impl BuildEvent {
    pub fn new(build_id: BuildId, plan_id: PlanId, kind: BuildEventKind) -> Self {
        Self {
            time: Utc::now(),
            build_id,
            plan_id,
            kind,
        }
    }
}
