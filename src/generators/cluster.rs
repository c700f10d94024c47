//! Clusters generator: one parameter set per registered cluster
//!
//! Argo CD registers clusters as Secrets labelled
//! `argocd.argoproj.io/secret-type=cluster` whose data carries the cluster
//! `name` and `server`. The generator's selector is combined with that label.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::{append_values, Generator, Params, Selector};
use crate::crd::{ApplicationSet, GeneratorKind, GeneratorSpec};
use crate::Error;

/// A cluster registered with Argo CD
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterRecord {
    /// Cluster name
    pub name: String,
    /// API server URL
    pub server: String,
    /// Labels of the registration record
    pub labels: BTreeMap<String, String>,
}

/// Store of registered clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// List clusters whose registration labels satisfy `selector`
    async fn list_clusters(&self, selector: &Selector) -> Result<Vec<ClusterRecord>, Error>;
}

/// Cluster registry backed by Argo CD cluster Secrets
pub struct SecretClusterRegistry {
    client: Client,
    namespace: String,
}

impl SecretClusterRegistry {
    /// Read cluster secrets from `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

/// Convert a cluster Secret into a record.
///
/// The cluster name comes from `data.name`, falling back to the Secret name.
fn record_from_secret(secret: &Secret) -> ClusterRecord {
    let data_field = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
    };

    ClusterRecord {
        name: data_field("name")
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| secret.name_any()),
        server: data_field("server").unwrap_or_default(),
        labels: secret.labels().clone(),
    }
}

#[async_trait]
impl ClusterRegistry for SecretClusterRegistry {
    async fn list_clusters(&self, selector: &Selector) -> Result<Vec<ClusterRecord>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&selector.to_string());
        let secrets = api.list(&lp).await?;

        debug!(count = secrets.items.len(), selector = %selector, "listed cluster secrets");

        Ok(secrets.items.iter().map(record_from_secret).collect())
    }
}

/// Emits `name`, `server`, `metadata.labels.<key>` and `values.<key>` per cluster
pub struct ClusterParamsGenerator<R: ClusterRegistry> {
    registry: R,
}

impl<R: ClusterRegistry> ClusterParamsGenerator<R> {
    /// Create a generator over `registry`
    pub fn new(registry: R) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<R: ClusterRegistry> Generator for ClusterParamsGenerator<R> {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _owner: &ApplicationSet,
    ) -> Result<Option<Vec<Params>>, Error> {
        let GeneratorKind::Clusters(clusters) = spec.kind()? else {
            return Ok(None);
        };

        let selector = Selector::for_cluster_secrets(&clusters.selector)?;
        let records = self.registry.list_clusters(&selector).await?;

        let params = records
            .into_iter()
            // The registry may filter server-side only partially
            .filter(|record| selector.matches(&record.labels))
            .map(|record| {
                info!(cluster = %record.name, "matched cluster");
                let mut params = Params::new();
                params.insert("name".to_string(), record.name);
                params.insert("server".to_string(), record.server);
                for (key, value) in record.labels {
                    params.insert(format!("metadata.labels.{key}"), value);
                }
                append_values(&mut params, &clusters.values);
                params
            })
            .collect();

        Ok(Some(params))
    }
}
