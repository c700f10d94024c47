//! Equality and diff of Applications
//!
//! [`equal`] is the only input to the update decision. [`diff`] explains a
//! decision in logs as an RFC 7386 JSON merge patch that turns the first
//! projection into the second.

mod projection;

use serde_json::{Map, Value};

use crate::crd::Application;
use crate::Error;

pub use projection::{
    ProjectedDestination, ProjectedMetadata, ProjectedSource, ProjectedSpec, RelevantFields,
};

/// Whether two Applications agree on every relevant field
pub fn equal(a: &Application, b: &Application) -> bool {
    RelevantFields::of(a) == RelevantFields::of(b)
}

/// Merge patch from `from` to `to` over the relevant fields; `{}` when equal
pub fn diff(from: &Application, to: &Application) -> Result<String, Error> {
    let from = serde_json::to_value(RelevantFields::of(from))?;
    let to = serde_json::to_value(RelevantFields::of(to))?;
    let patch = merge_patch(&from, &to).unwrap_or_else(|| Value::Object(Map::new()));
    Ok(serde_json::to_string(&patch)?)
}

/// Two-way merge patch; `None` when the values are equal.
///
/// Removed keys become `null`; objects present on both sides recurse; any
/// other change replaces the value wholesale (arrays included).
fn merge_patch(from: &Value, to: &Value) -> Option<Value> {
    if from == to {
        return None;
    }

    match (from, to) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            for (key, new_value) in new {
                match old.get(key) {
                    Some(old_value) => {
                        if let Some(child) = merge_patch(old_value, new_value) {
                            patch.insert(key.clone(), child);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            Some(Value::Object(patch))
        }
        (_, new) => Some(new.clone()),
    }
}
