//! Label selectors for cluster secrets

use std::collections::BTreeMap;
use std::fmt;

use crate::crd::{LabelSelector, LabelSelectorRequirement, SelectorOperator};
use crate::{Error, SECRET_TYPE_CLUSTER, SECRET_TYPE_LABEL};

/// A validated label selector.
///
/// Renders to the Kubernetes label selector string for server-side filtering
/// and evaluates the same requirements locally with [`Selector::matches`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    match_labels: BTreeMap<String, String>,
    expressions: Vec<LabelSelectorRequirement>,
}

impl Selector {
    /// Validate a CRD selector
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self, Error> {
        for req in &selector.match_expressions {
            let needs_values = matches!(req.operator, SelectorOperator::In | SelectorOperator::NotIn);
            if needs_values && req.values.is_empty() {
                return Err(Error::generator(
                    "clusters",
                    format!("selector requirement on '{}' needs at least one value", req.key),
                ));
            }
            if !needs_values && !req.values.is_empty() {
                return Err(Error::generator(
                    "clusters",
                    format!("selector requirement on '{}' must not list values", req.key),
                ));
            }
        }

        Ok(Self {
            match_labels: selector.match_labels.clone(),
            expressions: selector.match_expressions.clone(),
        })
    }

    /// Selector for cluster secrets: `selector` AND the cluster discriminator label
    pub fn for_cluster_secrets(selector: &LabelSelector) -> Result<Self, Error> {
        let mut merged = Self::from_label_selector(selector)?;
        merged
            .match_labels
            .insert(SECRET_TYPE_LABEL.to_string(), SECRET_TYPE_CLUSTER.to_string());
        Ok(merged)
    }

    /// Whether a label set satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_ok = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_ok
            && self.expressions.iter().all(|req| {
                let value = labels.get(&req.key);
                match req.operator {
                    SelectorOperator::In => value.is_some_and(|v| req.values.contains(v)),
                    SelectorOperator::NotIn => value.map_or(true, |v| !req.values.contains(v)),
                    SelectorOperator::Exists => value.is_some(),
                    SelectorOperator::DoesNotExist => value.is_none(),
                }
            })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        parts.extend(self.expressions.iter().map(|req| match req.operator {
            SelectorOperator::In => format!("{} in ({})", req.key, req.values.join(",")),
            SelectorOperator::NotIn => format!("{} notin ({})", req.key, req.values.join(",")),
            SelectorOperator::Exists => req.key.clone(),
            SelectorOperator::DoesNotExist => format!("!{}", req.key),
        }));

        write!(f, "{}", parts.join(","))
    }
}
