//! Artifact handles passed between steps of a build.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque reference to an artifact (a volume or stored blob) produced during
/// a build. Handles are cheap to clone; the bytes stay wherever the worker
/// put them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{handle}")]
pub struct ArtifactHandle {
    /// Backend-specific handle (volume handle, blob key).
    pub handle: String,
    /// Worker holding the artifact, if it lives on a worker.
    pub worker: Option<String>,
    /// When the artifact was registered.
    pub created_at: DateTime<Utc>,
}

impl ArtifactHandle {
    /// Create a handle for an artifact living on `worker`.
    pub fn on_worker(handle: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            worker: Some(worker.into()),
            created_at: Utc::now(),
        }
    }

    /// Create a handle for an artifact stored outside any worker
    /// (e.g. uploaded with a one-off build).
    pub fn detached(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            worker: None,
            created_at: Utc::now(),
        }
    }

    /// Create a handle with a fresh random id on `worker`.
    pub fn generate(worker: impl Into<String>) -> Self {
        Self::on_worker(Uuid::new_v4().to_string(), worker)
    }
}
