//! ApplicationSet Custom Resource Definition
//!
//! An ApplicationSet pairs an ordered list of generators with an Application
//! template. Every parameter set a generator produces is rendered into one
//! Application owned by the ApplicationSet.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::application::ApplicationSpec;
use super::types::{Condition, ConditionStatus, LabelSelector};
use crate::Error;

/// Specification for an ApplicationSet
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "ApplicationSet",
    plural = "applicationsets",
    shortname = "appset",
    shortname = "appsets",
    status = "ApplicationSetStatus",
    namespaced,
    printcolumn = r#"{"name":"Applications","type":"integer","jsonPath":".status.applicationCount"}"#,
    printcolumn = r#"{"name":"UpToDate","type":"string","jsonPath":".status.conditions[?(@.type==\"ResourcesUpToDate\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSpec {
    /// Parameter generators, evaluated in order
    pub generators: Vec<GeneratorSpec>,

    /// Application template rendered once per parameter set
    pub template: ApplicationTemplate,

    /// What happens to generated Applications when the set is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<ApplicationSetSyncPolicy>,
}

impl ApplicationSetSpec {
    /// Whether generated Applications outlive the ApplicationSet
    pub fn preserves_resources_on_deletion(&self) -> bool {
        self.sync_policy
            .as_ref()
            .is_some_and(|p| p.preserve_resources_on_deletion)
    }
}

/// Deletion behaviour of an ApplicationSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSyncPolicy {
    /// Orphan generated Applications instead of letting garbage collection delete them
    #[serde(default)]
    pub preserve_resources_on_deletion: bool,
}

/// One generator entry.
///
/// The wire format keeps Argo CD's shape (one optional key per kind); code
/// works with [`GeneratorKind`] obtained through [`GeneratorSpec::kind`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorSpec {
    /// Static list of elements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<ListGenerator>,

    /// Clusters registered with Argo CD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<ClusterGenerator>,

    /// Directories or files in a git repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitGenerator>,
}

/// The populated kind of a [`GeneratorSpec`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GeneratorKind<'a> {
    /// List generator
    List(&'a ListGenerator),
    /// Clusters generator
    Clusters(&'a ClusterGenerator),
    /// Git generator
    Git(&'a GitGenerator),
}

impl GeneratorKind<'_> {
    /// Short name used in logs, errors and status
    pub fn name(&self) -> &'static str {
        match self {
            Self::List(_) => "list",
            Self::Clusters(_) => "clusters",
            Self::Git(_) => "git",
        }
    }
}

impl GeneratorSpec {
    /// Resolve the single populated kind.
    ///
    /// No kind is [`Error::EmptyGenerator`]; more than one is a validation error.
    pub fn kind(&self) -> Result<GeneratorKind<'_>, Error> {
        let mut kinds = self
            .list
            .as_ref()
            .map(GeneratorKind::List)
            .into_iter()
            .chain(self.clusters.as_ref().map(GeneratorKind::Clusters))
            .chain(self.git.as_ref().map(GeneratorKind::Git));

        match (kinds.next(), kinds.next()) {
            (None, _) => Err(Error::EmptyGenerator),
            (Some(kind), None) => Ok(kind),
            (Some(first), Some(second)) => Err(Error::validation(format!(
                "generator sets both {} and {}; exactly one kind is allowed per entry",
                first.name(),
                second.name()
            ))),
        }
    }
}

/// Static list of parameter sets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ListGenerator {
    /// One parameter set per element
    pub elements: Vec<ListElement>,
}

/// One element of a list generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ListElement {
    /// Cluster name, exposed as `cluster`
    pub cluster: String,
    /// Cluster API server URL, exposed as `url`
    pub url: String,
    /// Extra values, exposed as `values.<key>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

/// Clusters registered with Argo CD, filtered by label
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ClusterGenerator {
    /// Label selector applied to cluster secrets; empty matches every cluster
    #[serde(default)]
    pub selector: LabelSelector,
    /// Extra values added to every parameter set as `values.<key>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

/// Directories or files of a git repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitGenerator {
    /// Repository URL
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    /// Branch, tag or commit
    #[serde(default = "default_revision")]
    pub revision: String,

    /// Directory globs; one parameter set per matching directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<GitDirectoryItem>,

    /// File globs; one parameter set per matching JSON/YAML file
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<GitFileItem>,

    /// Extra values added to every parameter set as `values.<key>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

fn default_revision() -> String {
    "HEAD".to_string()
}

/// Directory glob of a git generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GitDirectoryItem {
    /// Glob matched against repository-relative directory paths
    pub path: String,
    /// Remove matching directories instead of adding them
    #[serde(default)]
    pub exclude: bool,
}

/// File glob of a git generator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GitFileItem {
    /// Glob matched against repository-relative file paths
    pub path: String,
}

/// Application template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ApplicationTemplate {
    /// Metadata of generated Applications
    pub metadata: ApplicationTemplateMeta,
    /// Spec of generated Applications
    pub spec: ApplicationSpec,
}

/// Metadata subset a template may set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ApplicationTemplateMeta {
    /// Application name; must render to a unique non-empty value
    pub name: String,

    /// Application namespace; defaults to the ApplicationSet namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Finalizers, e.g. `resources-finalizer.argocd.argoproj.io`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

/// Every generator entry produced its parameters
pub const CONDITION_PARAMETERS_GENERATED: &str = "ParametersGenerated";

/// Every desired Application exists and matches its template
pub const CONDITION_RESOURCES_UP_TO_DATE: &str = "ResourcesUpToDate";

/// The last pass recorded at least one failure
pub const CONDITION_ERROR_OCCURRED: &str = "ErrorOccurred";

/// Observed state of an ApplicationSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetStatus {
    /// Conditions, one per type
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Names of Applications currently produced by this set
    #[serde(default)]
    pub applications: Vec<String>,

    /// Number of entries in `applications`
    #[serde(default)]
    pub application_count: u32,

    /// Generation the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ApplicationSetStatus {
    /// Start a new status from the previous one, keeping its conditions so
    /// unchanged conditions keep their transition time
    pub fn from_previous(previous: Option<&ApplicationSetStatus>) -> Self {
        Self {
            conditions: previous.map(|s| s.conditions.clone()).unwrap_or_default(),
            ..Default::default()
        }
    }

    /// Set a condition, replacing any existing condition of the same type.
    ///
    /// `lastTransitionTime` is only moved when the status value changes.
    pub fn condition(mut self, mut condition: Condition) -> Self {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
        self
    }

    /// Set the managed Application names
    pub fn applications(mut self, mut names: Vec<String>) -> Self {
        names.sort();
        self.application_count = u32::try_from(names.len()).unwrap_or(u32::MAX);
        self.applications = names;
        self
    }

    /// Set the observed generation
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// When the current run of failed passes began, if the set is failing
    pub fn failing_since(&self) -> Option<DateTime<Utc>> {
        self.get_condition(CONDITION_ERROR_OCCURRED)
            .filter(|c| c.status == ConditionStatus::True)
            .map(|c| c.last_transition_time)
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether the given condition type is currently True
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.get_condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}
