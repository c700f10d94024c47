//! Parameter generators
//!
//! A generator turns one generator entry of an ApplicationSet into parameter
//! sets, one per Application to produce. Three kinds exist:
//!
//! - [`ListParamsGenerator`] - static elements declared inline
//! - [`ClusterParamsGenerator`] - clusters registered with Argo CD
//! - [`GitParamsGenerator`] - directories or files in a git repository
//!
//! [`GeneratorSet`] runs every entry of an ApplicationSet through the
//! matching generator and keeps going when one of them fails.

mod cluster;
mod git;
mod list;
mod repo_server;
mod selector;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{ApplicationSet, GeneratorKind, GeneratorSpec};
use crate::Error;

pub use cluster::{ClusterParamsGenerator, ClusterRecord, ClusterRegistry, SecretClusterRegistry};
#[cfg(test)]
pub use cluster::MockClusterRegistry;
pub use git::{GitParamsGenerator, RepoService};
#[cfg(test)]
pub use git::MockRepoService;
pub use list::ListParamsGenerator;
pub use repo_server::GrpcRepoService;
pub use selector::Selector;

/// One parameter set: flattened parameter name to value
pub type Params = BTreeMap<String, String>;

/// Produces parameter sets for one kind of generator entry
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate parameter sets for `spec`.
    ///
    /// Returns `Ok(None)` when `spec` is of a different kind, and
    /// [`Error::EmptyGenerator`] when no kind is set at all.
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        owner: &ApplicationSet,
    ) -> Result<Option<Vec<Params>>, Error>;
}

/// A generator entry that failed to produce parameters
#[derive(Debug)]
pub struct GeneratorFailure {
    /// Position of the entry in `spec.generators`
    pub index: usize,
    /// Generator kind, or "unknown" when the entry has none
    pub kind: &'static str,
    /// What went wrong
    pub error: Error,
}

impl std::fmt::Display for GeneratorFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "generators[{}] ({}): {}", self.index, self.kind, self.error)
    }
}

/// Parameter sets of every generator entry, plus the entries that failed
#[derive(Debug, Default)]
pub struct Generated {
    /// Parameter sets in entry order, then generator order
    pub params: Vec<Params>,
    /// One record per failed entry
    pub failures: Vec<GeneratorFailure>,
}

/// Dispatches generator entries to the generator for their kind
#[derive(Clone)]
pub struct GeneratorSet {
    list: Arc<dyn Generator>,
    clusters: Arc<dyn Generator>,
    git: Arc<dyn Generator>,
}

impl GeneratorSet {
    /// Create a set from one generator per kind
    pub fn new(
        list: Arc<dyn Generator>,
        clusters: Arc<dyn Generator>,
        git: Arc<dyn Generator>,
    ) -> Self {
        Self {
            list,
            clusters,
            git,
        }
    }

    fn for_kind(&self, kind: &GeneratorKind<'_>) -> &dyn Generator {
        match kind {
            GeneratorKind::List(_) => self.list.as_ref(),
            GeneratorKind::Clusters(_) => self.clusters.as_ref(),
            GeneratorKind::Git(_) => self.git.as_ref(),
        }
    }

    /// Run every generator entry of `owner`.
    ///
    /// A failing entry is recorded and skipped; it never stops the others.
    pub async fn generate_all(&self, owner: &ApplicationSet) -> Generated {
        let mut generated = Generated::default();

        for (index, spec) in owner.spec.generators.iter().enumerate() {
            let kind = match spec.kind() {
                Ok(kind) => kind,
                Err(error) => {
                    warn!(index, %error, "skipping invalid generator entry");
                    generated.failures.push(GeneratorFailure {
                        index,
                        kind: "unknown",
                        error,
                    });
                    continue;
                }
            };

            match self.for_kind(&kind).generate_params(spec, owner).await {
                Ok(Some(params)) => {
                    debug!(index, kind = kind.name(), count = params.len(), "generated parameters");
                    generated.params.extend(params);
                }
                Ok(None) => {
                    debug!(index, kind = kind.name(), "generator not applicable to entry");
                }
                Err(error) => {
                    warn!(index, kind = kind.name(), %error, "generator failed");
                    generated.failures.push(GeneratorFailure {
                        index,
                        kind: kind.name(),
                        error,
                    });
                }
            }
        }

        generated
    }
}

/// Add `values.<key>` entries to a parameter set
pub(crate) fn append_values(params: &mut Params, values: &BTreeMap<String, String>) {
    for (key, value) in values {
        params.insert(format!("values.{key}"), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ApplicationSetSpec, ApplicationTemplate, ClusterGenerator, GitGenerator, ListElement,
        ListGenerator,
    };
    use kube::api::ObjectMeta;

    pub(crate) fn owner_with(generators: Vec<GeneratorSpec>) -> ApplicationSet {
        ApplicationSet {
            metadata: ObjectMeta {
                name: Some("guestbook".to_string()),
                namespace: Some("argocd".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: ApplicationSetSpec {
                generators,
                template: ApplicationTemplate::default(),
                sync_policy: None,
            },
            status: None,
        }
    }

    fn list_spec(cluster: &str) -> GeneratorSpec {
        GeneratorSpec {
            list: Some(ListGenerator {
                elements: vec![ListElement {
                    cluster: cluster.to_string(),
                    url: format!("https://{cluster}"),
                    values: Default::default(),
                }],
            }),
            ..Default::default()
        }
    }

    fn git_spec() -> GeneratorSpec {
        GeneratorSpec {
            git: Some(GitGenerator {
                repo_url: "https://example.com/repo.git".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn params_for(name: &str) -> Vec<Params> {
        vec![Params::from([("name".to_string(), name.to_string())])]
    }

    fn set_with(clusters: MockGenerator, git: MockGenerator) -> GeneratorSet {
        GeneratorSet::new(
            Arc::new(ListParamsGenerator::new()),
            Arc::new(clusters),
            Arc::new(git),
        )
    }

    /// Story: the second of three generators fails, the other two still
    /// contribute their parameters and exactly one failure is recorded.
    #[tokio::test]
    async fn story_failing_generator_is_isolated() {
        let mut clusters = MockGenerator::new();
        clusters
            .expect_generate_params()
            .returning(|_, _| Err(Error::generator("clusters", "secret list forbidden")));
        let mut git = MockGenerator::new();
        git.expect_generate_params()
            .returning(|_, _| Ok(Some(params_for("from-git"))));

        let owner = owner_with(vec![
            list_spec("dev"),
            GeneratorSpec {
                clusters: Some(ClusterGenerator::default()),
                ..Default::default()
            },
            git_spec(),
        ]);

        let generated = set_with(clusters, git).generate_all(&owner).await;

        assert_eq!(generated.params.len(), 2);
        assert_eq!(generated.params[0].get("cluster").map(String::as_str), Some("dev"));
        assert_eq!(generated.params[1].get("name").map(String::as_str), Some("from-git"));
        assert_eq!(generated.failures.len(), 1);
        assert_eq!(generated.failures[0].index, 1);
        assert_eq!(generated.failures[0].kind, "clusters");
    }

    #[tokio::test]
    async fn test_empty_entry_is_recorded_and_skipped() {
        let clusters = MockGenerator::new();
        let git = MockGenerator::new();
        let owner = owner_with(vec![GeneratorSpec::default(), list_spec("prod")]);

        let generated = set_with(clusters, git).generate_all(&owner).await;

        assert_eq!(generated.params.len(), 1);
        assert_eq!(generated.failures.len(), 1);
        assert!(matches!(generated.failures[0].error, Error::EmptyGenerator));
        assert_eq!(generated.failures[0].kind, "unknown");
        assert!(generated.failures[0].to_string().starts_with("generators[0]"));
    }

    #[tokio::test]
    async fn test_output_preserves_entry_order() {
        let clusters = MockGenerator::new();
        let mut git = MockGenerator::new();
        git.expect_generate_params()
            .returning(|_, _| Ok(Some(params_for("middle"))));

        let owner = owner_with(vec![list_spec("first"), git_spec(), list_spec("last")]);
        let generated = set_with(clusters, git).generate_all(&owner).await;

        let order: Vec<_> = generated
            .params
            .iter()
            .map(|p| p.get("cluster").or_else(|| p.get("name")).cloned().unwrap_or_default())
            .collect();
        assert_eq!(order, vec!["first", "middle", "last"]);
    }

    #[test]
    fn test_append_values() {
        let mut params = Params::new();
        append_values(
            &mut params,
            &BTreeMap::from([("tier".to_string(), "gold".to_string())]),
        );
        assert_eq!(params.get("values.tier").map(String::as_str), Some("gold"));
    }
}
