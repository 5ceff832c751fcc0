//! Build metadata.

use serde::{Deserialize, Serialize};

use crate::{BuildId, TeamName};

/// Identity of a build, handed to delegates and used for container ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub id: BuildId,
    pub name: String,
    pub team: TeamName,
    pub pipeline: Option<String>,
    pub job: Option<String>,
}

impl BuildInfo {
    /// Metadata for a one-off build outside any pipeline.
    pub fn one_off(team: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: BuildId::new(),
            name: name.into(),
            team: TeamName::new(team),
            pipeline: None,
            job: None,
        }
    }
}
