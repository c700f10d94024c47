//! Relevant-field projection of an Application
//!
//! Only these fields take part in equality and diff output. Status, uid,
//! resourceVersion, timestamps, managed fields and owner references are
//! written by the API server or by Argo CD and are never compared.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::crd::Application;

/// Reconciliation-relevant view of an Application.
///
/// Absent and empty values project identically, so a live object that lost
/// an empty label map in a round trip still compares equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelevantFields {
    /// Identity and user-visible metadata
    pub metadata: ProjectedMetadata,
    /// Fixed subset of the Application spec
    pub spec: ProjectedSpec,
}

/// Projected metadata
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProjectedMetadata {
    /// Name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Namespace
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Labels
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Finalizers, order preserved
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

/// Projected spec
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProjectedSpec {
    /// Source location
    pub source: ProjectedSource,
    /// Deployment target
    pub destination: ProjectedDestination,
    /// Argo CD project
    #[serde(skip_serializing_if = "String::is_empty")]
    pub project: String,
}

/// Projected source
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedSource {
    /// Repository URL
    #[serde(rename = "repoURL", skip_serializing_if = "String::is_empty")]
    pub repo_url: String,
    /// Path within the repository
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Revision
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target_revision: String,
}

/// Projected destination
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProjectedDestination {
    /// API server URL
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server: String,
    /// Cluster name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Namespace
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl RelevantFields {
    /// Project an Application
    pub fn of(app: &Application) -> Self {
        let meta = &app.metadata;
        let spec = &app.spec;

        Self {
            metadata: ProjectedMetadata {
                name: meta.name.clone().unwrap_or_default(),
                namespace: meta.namespace.clone().unwrap_or_default(),
                labels: meta.labels.clone().unwrap_or_default(),
                annotations: meta.annotations.clone().unwrap_or_default(),
                finalizers: meta.finalizers.clone().unwrap_or_default(),
            },
            spec: ProjectedSpec {
                source: ProjectedSource {
                    repo_url: spec.source.repo_url.clone(),
                    path: spec.source.path.clone().unwrap_or_default(),
                    target_revision: spec.source.target_revision.clone().unwrap_or_default(),
                },
                destination: ProjectedDestination {
                    server: spec.destination.server.clone().unwrap_or_default(),
                    name: spec.destination.name.clone().unwrap_or_default(),
                    namespace: spec.destination.namespace.clone().unwrap_or_default(),
                },
                project: spec.project.clone(),
            },
        }
    }
}
