//! Three-way comparison of desired and live Applications

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::debug;

use crate::crd::Application;
use crate::diff;

/// Write needed to move one Application toward its desired state
#[derive(Clone, Debug)]
pub enum Operation {
    /// Application is desired but absent
    Create(Application),
    /// Live Application drifted; carries the live object with desired fields overlaid
    Update(Application),
    /// Application is live but no longer desired
    Delete(Application),
}

impl Operation {
    /// Name of the Application this operation touches
    pub fn name(&self) -> String {
        match self {
            Self::Create(app) | Self::Update(app) | Self::Delete(app) => app.name_any(),
        }
    }

    /// Verb for logs
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }
}

/// Operations for one pass plus the names already in their desired state
#[derive(Debug, Default)]
pub struct Plan {
    /// At most one operation per name
    pub operations: Vec<Operation>,
    /// Names that are live and equal to their desired state
    pub unchanged: Vec<String>,
}

/// Overlay the template-controlled fields of `desired` onto `live`.
///
/// Everything else on the live object (resourceVersion, uid, owner
/// references, status) is kept so the replace is a compare-and-swap.
pub fn overlay(live: &Application, desired: &Application) -> Application {
    let mut merged = live.clone();
    merged.metadata.labels = desired.metadata.labels.clone();
    merged.metadata.annotations = desired.metadata.annotations.clone();
    merged.metadata.finalizers = desired.metadata.finalizers.clone();
    merged.spec = desired.spec.clone();
    merged
}

/// Compare desired and live Applications by name.
///
/// With `allow_deletes` false, live-only Applications are left alone; a pass
/// whose parameters are incomplete cannot tell a retired Application from one
/// whose generator failed.
pub fn plan(desired: Vec<Application>, live: Vec<Application>, allow_deletes: bool) -> Plan {
    let mut live: BTreeMap<String, Application> =
        live.into_iter().map(|app| (app.name_any(), app)).collect();
    let mut plan = Plan::default();

    for want in desired {
        let name = want.name_any();
        match live.remove(&name) {
            None => plan.operations.push(Operation::Create(want)),
            Some(have) if diff::equal(&have, &want) => plan.unchanged.push(name),
            Some(have) => {
                if let Ok(patch) = diff::diff(&have, &want) {
                    debug!(application = %name, %patch, "application drifted");
                }
                plan.operations.push(Operation::Update(overlay(&have, &want)));
            }
        }
    }

    if allow_deletes {
        plan.operations
            .extend(live.into_values().map(Operation::Delete));
    } else if !live.is_empty() {
        debug!(count = live.len(), "keeping undesired applications until generators recover");
        plan.unchanged.extend(live.into_keys());
    }

    plan
}
