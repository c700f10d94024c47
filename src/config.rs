//! Controller configuration
//!
//! Populated from the command line in `main.rs`; tests build it with
//! [`ControllerConfig::default`] and override what they need.

use std::time::Duration;

use crate::{DEFAULT_ARGOCD_NAMESPACE, DEFAULT_REPO_SERVER, DEFAULT_REPO_SERVER_MAX_CONNECTIONS};

/// Runtime settings shared by every reconciliation pass
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Repository server gRPC address
    pub repo_server: String,
    /// Per-call timeout for repository server requests
    pub repo_server_timeout: Duration,
    /// Concurrent requests allowed on the repository server channel
    pub repo_server_max_connections: usize,
    /// Namespace holding Argo CD cluster secrets
    pub argocd_namespace: String,
    /// Restrict the controller to a single namespace (None = all namespaces)
    pub watch_namespace: Option<String>,
    /// Wall-clock budget for one reconciliation pass
    pub pass_timeout: Duration,
    /// Concurrent create/update/delete calls within one pass
    pub apply_concurrency: usize,
    /// Requeue interval after a fully successful pass
    pub resync_interval: Duration,
    /// First requeue delay after a failed pass
    pub failure_backoff_base: Duration,
    /// Upper bound on the requeue delay after failed passes
    pub failure_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            repo_server: DEFAULT_REPO_SERVER.to_string(),
            repo_server_timeout: Duration::from_secs(60),
            repo_server_max_connections: DEFAULT_REPO_SERVER_MAX_CONNECTIONS,
            argocd_namespace: DEFAULT_ARGOCD_NAMESPACE.to_string(),
            watch_namespace: None,
            pass_timeout: Duration::from_secs(120),
            apply_concurrency: 8,
            resync_interval: Duration::from_secs(180),
            failure_backoff_base: Duration::from_secs(10),
            failure_backoff_max: Duration::from_secs(300),
        }
    }
}
