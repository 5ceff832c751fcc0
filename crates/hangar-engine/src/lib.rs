//! Build driver for Hangar.
//!
//! Compiles build plans into step trees, runs them against a shared worker
//! pool, maps their results to a build status and drains running builds on
//! shutdown.

pub mod builder;
pub mod delegate;
pub mod engine;
pub mod event;
pub mod status;

pub use builder::StepBuilder;
pub use delegate::{EventDelegate, EventDelegateFactory};
pub use engine::{Build, BuildSpec, Engine, Runnable};
pub use event::{BuildEvent, BuildEventKind, LogStream};
pub use status::{BuildStatus, RunOutcome};
