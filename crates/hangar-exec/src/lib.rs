//! Build step execution for Hangar.
//!
//! Provides:
//! - [`RunState`], the per-build store of artifacts and step results
//! - Delegate contracts leaf steps report through
//! - Worker selection with bounded waiting
//! - The [`Step`] tree interpreter: leaf steps and combinators

pub mod delegate;
pub mod run_state;
pub mod select;
pub mod step;
pub mod vars;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use delegate::{
    BuildStepDelegate, DelegateFactory, GetDelegate, PutDelegate, SetPipelineDelegate,
    TaskDelegate,
};
pub use run_state::{RunState, StepOutput};
pub use select::{SelectionSettings, select_worker};
pub use step::{Step, StepFactory};
