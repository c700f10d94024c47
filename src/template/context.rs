//! Parameter sets exposed to the template engine
//!
//! Generators emit flat maps with dotted keys (`metadata.labels.env`,
//! `path.basename`). [`ParamsContext`] lets templates address them either
//! with attribute syntax (`${metadata.labels.env}`) or, for keys containing
//! characters that are not valid identifiers, with subscripts
//! (`${metadata.labels["app.kubernetes.io/name"]}`).
//!
//! A key can be both a value and a group: the Git generator emits `path`
//! alongside `path.basename`. Such nodes print as their own value and still
//! resolve their children.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use minijinja::value::{Object, ObjectRepr};
use minijinja::Value;

use crate::generators::Params;

use super::error::TemplateError;

/// Template context built from one parameter set
#[derive(Debug, Clone)]
pub struct ParamsContext {
    root: Value,
}

impl ParamsContext {
    /// Build the context for a parameter set.
    ///
    /// Fails when two keys differ only in `-` versus `_`: templates cannot
    /// tell them apart.
    pub fn new(params: &Params) -> Result<Self, TemplateError> {
        let mut normalized: BTreeMap<String, String> = BTreeMap::new();
        let mut spelled: BTreeMap<String, &str> = BTreeMap::new();

        for (key, value) in params {
            let lookup = normalize_key(key);
            if let Some(first) = spelled.insert(lookup.clone(), key) {
                return Err(TemplateError::AmbiguousKey {
                    first: first.to_string(),
                    second: key.clone(),
                });
            }
            normalized.insert(lookup, value.clone());
        }

        Ok(Self {
            root: Value::from_object(ParamNode {
                params: Arc::new(normalized),
                path: None,
            }),
        })
    }

    /// Convert to minijinja Value for rendering
    pub fn to_value(&self) -> Value {
        self.root.clone()
    }
}

/// Hyphens inside `${...}` are rewritten to underscores before evaluation,
/// so keys are stored the same way.
fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
}

/// A node in the dotted key space of a parameter set
#[derive(Debug)]
pub(crate) struct ParamNode {
    params: Arc<BTreeMap<String, String>>,
    path: Option<String>,
}

impl ParamNode {
    fn child_path(&self, key: &str) -> String {
        match &self.path {
            Some(path) => format!("{path}.{key}"),
            None => key.to_string(),
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{path}.");
        self.params
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    /// The value stored at this node's own key, if any
    pub(crate) fn leaf(&self) -> Option<&str> {
        self.path
            .as_ref()
            .and_then(|p| self.params.get(p))
            .map(String::as_str)
    }

    /// Dotted key of this node
    pub(crate) fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("")
    }
}

impl Object for ParamNode {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = normalize_key(key.as_str()?);
        let path = self.child_path(&key);

        if self.has_children(&path) {
            Some(Value::from_object(ParamNode {
                params: Arc::clone(&self.params),
                path: Some(path),
            }))
        } else {
            self.params.get(&path).map(|v| Value::from(v.as_str()))
        }
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result
    where
        Self: Sized + 'static,
    {
        // A pure group has no value of its own; printing it is an error.
        match self.leaf() {
            Some(value) => f.write_str(value),
            None => Err(fmt::Error),
        }
    }
}

/// Resolve a filter argument to the string it stands for.
///
/// Plain strings pass through, parameter groups that also carry a value
/// yield that value, scalars are formatted.
pub(crate) fn param_string(value: &Value) -> Result<String, minijinja::Error> {
    if let Some(s) = value.as_str() {
        return Ok(s.to_string());
    }
    if value.is_undefined() {
        return Err(minijinja::Error::new(
            minijinja::ErrorKind::UndefinedError,
            "value is undefined",
        ));
    }
    if let Some(node) = value.downcast_object_ref::<ParamNode>() {
        return node.leaf().map(str::to_string).ok_or_else(|| {
            minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                format!("'{}' is a group of parameters, not a value", node.path()),
            )
        });
    }
    Ok(value.to_string())
}
