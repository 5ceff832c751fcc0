//! Engine configuration parsing.
//!
//! ```kdl
//! engine {
//!     placement-strategy "limit-active-tasks" max=4
//!     container-create-timeout "5m"
//!     worker-wait-timeout "5m"
//!     drain-grace "30s"
//! }
//! ```
//!
//! Every setting is optional; a document without an `engine` node yields the
//! defaults.

use crate::{ConfigError, ConfigResult, parse_duration};
use hangar_core::worker::PlacementStrategy;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings for running builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How workers are chosen among the eligible ones.
    pub placement_strategy: PlacementStrategy,
    /// Bound on waiting for an in-progress container creation.
    pub container_create_timeout: Duration,
    /// Bound on waiting for any worker to become eligible.
    pub worker_wait_timeout: Duration,
    /// How long a drain waits for in-flight builds when shutting down.
    pub drain_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            placement_strategy: PlacementStrategy::default(),
            container_create_timeout: Duration::from_secs(5 * 60),
            worker_wait_timeout: Duration::from_secs(5 * 60),
            drain_grace: Duration::from_secs(30),
        }
    }
}

/// Parse engine configuration from KDL text.
pub fn parse_engine_config(kdl: &str) -> ConfigResult<EngineConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut engine_nodes = doc.nodes().iter().filter(|n| n.name().value() == "engine");
    let Some(engine) = engine_nodes.next() else {
        return Ok(EngineConfig::default());
    };
    if engine_nodes.next().is_some() {
        return Err(ConfigError::Duplicate("engine".to_string()));
    }

    let mut config = EngineConfig::default();
    let Some(children) = engine.children() else {
        return Ok(config);
    };

    let mut seen = Vec::new();
    for child in children.nodes() {
        let name = child.name().value();
        if seen.contains(&name) {
            return Err(ConfigError::Duplicate(format!("engine.{}", name)));
        }
        seen.push(name);

        match name {
            "placement-strategy" => config.placement_strategy = parse_strategy(child)?,
            "container-create-timeout" => {
                config.container_create_timeout = get_duration_arg(child)?
            }
            "worker-wait-timeout" => config.worker_wait_timeout = get_duration_arg(child)?,
            "drain-grace" => config.drain_grace = get_duration_arg(child)?,
            _ => {}
        }
    }

    Ok(config)
}

/// Read and parse an engine configuration file.
pub fn load_engine_config(path: impl AsRef<Path>) -> ConfigResult<EngineConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_engine_config(&text)
}

fn parse_strategy(node: &KdlNode) -> ConfigResult<PlacementStrategy> {
    let field = node.name().value();
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;

    if name == "limit-active-tasks" {
        let max = node
            .get("max")
            .and_then(|v| v.as_integer())
            .ok_or_else(|| ConfigError::MissingField(format!("{} max", field)))?;
        let max = usize::try_from(max).map_err(|_| ConfigError::InvalidValue {
            field: format!("{} max", field),
            message: format!("{} is not a valid task limit", max),
        })?;
        return Ok(PlacementStrategy::LimitActiveTasks { max });
    }

    name.parse::<PlacementStrategy>().map_err(|message| ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    })
}

/// A duration given either as a string (`"90s"`) or as whole seconds.
fn get_duration_arg(node: &KdlNode) -> ConfigResult<Duration> {
    let field = node.name().value();
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;

    if let Some(seconds) = value.as_integer() {
        return u64::try_from(seconds)
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!("{} is not a valid number of seconds", seconds),
            });
    }

    let text = value.as_string().ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected a duration string".to_string(),
    })?;
    parse_duration(text).map_err(|message| ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    })
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}
