//! Interpolation of local vars into task params.
//!
//! Local vars are bound by `across` and referenced as `((.:name))`. A
//! reference to a var that is not bound is left untouched.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::run_state::RunState;

// Regex for matching ((.:name)) references
static LOCAL_VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\(\.:([a-zA-Z_][a-zA-Z0-9_-]*)\)\)").unwrap());

/// Replace every bound `((.:name))` in `input`.
///
/// String values are inserted as-is, anything else as JSON.
pub fn interpolate(input: &str, state: &RunState) -> String {
    LOCAL_VAR_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            match state.local_var(name) {
                Some(Value::String(value)) => value,
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .to_string()
}

/// Interpolate the values of a map.
pub fn interpolate_map(
    map: &BTreeMap<String, String>,
    state: &RunState,
) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), interpolate(v, state)))
        .collect()
}
