//! Argo CD Application types
//!
//! Only the fields the controller renders and compares are modelled. The
//! Application CRD itself is installed by Argo CD, so these types are never
//! used to generate a CRD manifest.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of an Argo CD Application
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "Application",
    plural = "applications",
    status = "ApplicationStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Where the manifests come from. Multi-source Applications (`sources`)
    /// are not modelled and read as an empty source.
    #[serde(default)]
    pub source: ApplicationSource,

    /// Where the manifests are deployed
    #[serde(default)]
    pub destination: ApplicationDestination,

    /// Argo CD project the Application belongs to
    #[serde(default)]
    pub project: String,

    /// Automated sync settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

/// Manifest source of an Application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    /// Git or Helm repository URL
    #[serde(rename = "repoURL", default)]
    pub repo_url: String,

    /// Directory within the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Branch, tag, commit or chart version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_revision: Option<String>,

    /// Helm chart name when the repository is a chart repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,

    /// Helm-specific options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSource>,
}

/// Helm options of an Application source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmSource {
    /// Values files relative to the source path
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_files: Vec<String>,

    /// Inline values YAML
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,

    /// Helm release name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
}

/// Deployment target of an Application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    /// API server URL of the target cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Registered cluster name (alternative to `server`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Target namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Sync policy of an Application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Automated sync; absent means manual sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<AutomatedSync>,

    /// Sync options such as `CreateNamespace=true`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
}

/// Automated sync settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedSync {
    /// Delete resources no longer in git
    #[serde(default)]
    pub prune: bool,
    /// Revert out-of-band changes in the cluster
    #[serde(default)]
    pub self_heal: bool,
}

/// Application status as written by Argo CD.
///
/// Kept opaque: the controller never reads it and never writes it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ApplicationStatus {
    /// Raw status fields
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}
