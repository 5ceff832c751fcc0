//! KDL configuration parsing for the Hangar build engine.
//!
//! This crate handles parsing of:
//! - Engine settings (the `engine { }` node)
//! - Human-readable durations such as `5m` or `1h30m`

pub mod duration;
pub mod engine;
pub mod error;

pub use duration::parse_duration;
pub use engine::{EngineConfig, load_engine_config, parse_engine_config};
pub use error::{ConfigError, ConfigResult};
