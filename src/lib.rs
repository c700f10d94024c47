//! appset - ApplicationSet controller for Argo CD
//!
//! Turns a small set of generator specifications into a managed fleet of
//! Argo CD `Application` resources and keeps that fleet synchronized with the
//! generators' current output.
//!
//! # Pipeline
//!
//! Every reconciliation pass runs the same one-directional pipeline:
//!
//! ```text
//! ApplicationSet -> generators -> params -> renderer -> desired Applications
//!                -> diff against owned live Applications -> create/update/delete
//! ```
//!
//! # Modules
//!
//! - [`crd`] - ApplicationSet CRD and the Argo CD Application types it produces
//! - [`generators`] - List, Clusters and Git parameter generators plus the aggregator
//! - [`template`] - `${...}` placeholder rendering of the Application template
//! - [`diff`] - Relevant-field projection, equality and merge-patch diff
//! - [`controller`] - Reconciliation loop and Kubernetes client seam
//! - [`config`] - Controller configuration
//! - [`retry`] - Backoff helpers for transient failures
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod diff;
pub mod error;
pub mod generators;
pub mod retry;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known names
// =============================================================================

/// Label identifying Argo CD secrets by purpose
pub const SECRET_TYPE_LABEL: &str = "argocd.argoproj.io/secret-type";

/// Value of [`SECRET_TYPE_LABEL`] on cluster registration secrets
pub const SECRET_TYPE_CLUSTER: &str = "cluster";

/// Field manager used for every write the controller makes
pub const FIELD_MANAGER: &str = "applicationset-controller";

/// Finalizer held on ApplicationSets whose Applications must survive deletion
pub const PRESERVE_FINALIZER: &str = "applicationset.argoproj.io/preserve";

/// Default address of the Argo CD repository server
pub const DEFAULT_REPO_SERVER: &str = "http://argocd-repo-server:8081";

/// Default number of concurrent connections to the repository server
pub const DEFAULT_REPO_SERVER_MAX_CONNECTIONS: usize = 5;

/// Default namespace holding Argo CD cluster secrets
pub const DEFAULT_ARGOCD_NAMESPACE: &str = "argocd";
