//! Custom Resource Definitions
//!
//! The controller owns the `ApplicationSet` CRD and writes Argo CD
//! `Application` resources.

mod application;
mod application_set;
mod types;

pub use application::{
    Application, ApplicationDestination, ApplicationSource, ApplicationSpec, ApplicationStatus,
    AutomatedSync, HelmSource, SyncPolicy,
};
pub use application_set::{
    ApplicationSet, ApplicationSetSpec, ApplicationSetStatus, ApplicationSetSyncPolicy,
    ApplicationTemplate, ApplicationTemplateMeta, ClusterGenerator, GeneratorKind, GeneratorSpec,
    GitDirectoryItem, GitFileItem, GitGenerator, ListElement, ListGenerator,
    CONDITION_ERROR_OCCURRED, CONDITION_PARAMETERS_GENERATED, CONDITION_RESOURCES_UP_TO_DATE,
};
pub use types::{
    Condition, ConditionStatus, LabelSelector, LabelSelectorRequirement, SelectorOperator,
};
