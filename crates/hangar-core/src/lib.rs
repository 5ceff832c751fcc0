//! Core domain types and collaborator contracts for the Hangar build engine.
//!
//! This crate contains:
//! - Build and plan identifiers
//! - The build plan tree
//! - Cancellation contexts and the error taxonomy
//! - Artifact handles
//! - Worker and pipeline storage contracts

pub mod artifact;
pub mod build;
pub mod context;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod plan;
pub mod worker;

pub use artifact::ArtifactHandle;
pub use build::BuildInfo;
pub use context::{CancelCause, Context};
pub use error::{ExecError, Result, StepResult};
pub use id::{BuildId, PlanId, TeamName};
