//! ApplicationSet controller implementation
//!
//! One reconciliation pass recomputes the desired Applications of a set from
//! its generators and template, compares them by name with the Applications
//! the set owns, and creates, updates or deletes until the two agree.
//!
//! A pass never stops at the first failure. Generator entries, parameter
//! sets and Application writes each fail on their own; every failure is
//! recorded in the [`PassReport`], surfaced in status conditions, and the set
//! is requeued with backoff while anything is failing.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::client::{AppSetClient, KubeClientImpl};
use super::plan::{self, Operation};
use crate::config::ControllerConfig;
use crate::crd::{
    Application, ApplicationSet, ApplicationSetStatus, Condition, ConditionStatus,
    CONDITION_ERROR_OCCURRED, CONDITION_PARAMETERS_GENERATED, CONDITION_RESOURCES_UP_TO_DATE,
};
use crate::generators::{
    ClusterParamsGenerator, GeneratorSet, GitParamsGenerator, GrpcRepoService,
    ListParamsGenerator, Params, SecretClusterRegistry,
};
use crate::retry::requeue_delay;
use crate::template::Renderer;
use crate::{Error, PRESERVE_FINALIZER};

/// Failures listed verbatim in the ErrorOccurred message
const MAX_REPORTED_FAILURES: usize = 5;

/// Controller context passed to every reconciliation
pub struct Context {
    /// API operations (trait object for testability)
    pub client: Arc<dyn AppSetClient>,
    /// One generator per generator kind
    pub generators: GeneratorSet,
    /// Application template renderer
    pub renderer: Renderer,
    /// Runtime settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Arc<dyn AppSetClient>, generators: GeneratorSet) -> ContextBuilder {
        ContextBuilder::new(client, generators)
    }

    /// Wire the production context: API server, cluster Secrets and the
    /// repository server at `config.repo_server`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(client: Client, config: ControllerConfig) -> Result<Self, Error> {
        let repo = GrpcRepoService::connect_lazy(
            &config.repo_server,
            config.repo_server_max_connections,
            config.repo_server_timeout,
        )?;
        let registry = SecretClusterRegistry::new(client.clone(), config.argocd_namespace.clone());

        let generators = GeneratorSet::new(
            Arc::new(ListParamsGenerator::new()),
            Arc::new(ClusterParamsGenerator::new(registry)),
            Arc::new(GitParamsGenerator::new(repo)),
        );

        Self::builder(Arc::new(KubeClientImpl::new(client)), generators)
            .config(config)
            .build()
    }

    /// Context over the given client and generators with default settings
    #[cfg(test)]
    pub fn for_testing(client: Arc<dyn AppSetClient>, generators: GeneratorSet) -> Arc<Self> {
        Arc::new(
            Self::builder(client, generators)
                .build()
                .expect("default renderer builds"),
        )
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Arc<dyn AppSetClient>,
    generators: GeneratorSet,
    renderer: Option<Renderer>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Arc<dyn AppSetClient>, generators: GeneratorSet) -> Self {
        Self {
            client,
            generators,
            renderer: None,
            config: ControllerConfig::default(),
        }
    }

    /// Set the runtime configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the template renderer
    pub fn renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let renderer = match self.renderer {
            Some(renderer) => renderer,
            None => Renderer::new()?,
        };

        Ok(Context {
            client: self.client,
            generators: self.generators,
            renderer,
            config: self.config,
        })
    }
}

/// The part of a pass that failed.
///
/// Orders generator entries first, then parameter sets, then Application
/// writes; indices compare as numbers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailedUnit {
    /// A generator entry, by position in `spec.generators`
    Generator {
        /// Position of the entry
        index: usize,
        /// Generator kind of the entry
        kind: &'static str,
    },
    /// A parameter set, by position in the generated list
    Params {
        /// Position of the parameter set
        index: usize,
        /// Application name, when it rendered
        application: Option<String>,
    },
    /// A write to the named Application
    Application(String),
}

impl std::fmt::Display for FailedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generator { index, kind } => write!(f, "generators[{index}] ({kind})"),
            Self::Params {
                index,
                application: Some(name),
            } => write!(f, "params[{index}] application {name}"),
            Self::Params { index, .. } => write!(f, "params[{index}]"),
            Self::Application(name) => write!(f, "application {name}"),
        }
    }
}

/// One failed unit of a pass: a generator entry, a parameter set or an
/// Application write
#[derive(Debug)]
pub struct UnitFailure {
    /// What failed
    pub unit: FailedUnit,
    /// Why
    pub error: Error,
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.unit, self.error)
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default)]
pub struct PassReport {
    /// Applications created
    pub created: Vec<String>,
    /// Applications replaced
    pub updated: Vec<String>,
    /// Applications deleted
    pub deleted: Vec<String>,
    /// Applications already in their desired state
    pub unchanged: usize,
    /// Applications owned by the set after the pass
    pub managed: Vec<String>,
    /// Generator entries that produced no parameters
    pub generator_failures: usize,
    /// Parameter sets that rendered no Application
    pub render_failures: usize,
    /// Every failed unit, ordered by [`FailedUnit`]
    pub failures: Vec<UnitFailure>,
}

impl PassReport {
    /// Number of writes that succeeded
    pub fn applied(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// Whether any unit failed
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Whether the desired set is complete, so live Applications outside it
    /// are really retired. A duplicate name leaves it complete: the name is
    /// already desired through its first occurrence.
    pub fn desired_is_complete(&self) -> bool {
        self.generator_failures == 0 && self.render_failures == 0
    }

    fn fail(&mut self, unit: FailedUnit, error: Error) {
        self.failures.push(UnitFailure { unit, error });
    }
}

/// Reconcile an ApplicationSet
///
/// The pass runs under `pass_timeout`; writes completed before the deadline
/// are kept and the next pass picks up from the live state. A pass that
/// ends in an error is still recorded in the ErrorOccurred condition.
#[instrument(
    skip(appset, ctx),
    fields(appset = %appset.name_any(), namespace = %appset.namespace().unwrap_or_default())
)]
pub async fn reconcile(appset: Arc<ApplicationSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let budget = ctx.config.pass_timeout;
    let result = match tokio::time::timeout(budget, reconcile_pass(&appset, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(budget.as_secs())),
    };

    if let Err(error) = &result {
        record_pass_error(&appset, error, &ctx).await;
    }
    result
}

/// Best-effort status write for a pass that failed before writing its own.
///
/// Starts from the status the set was observed with, so managed
/// Applications and observedGeneration are kept. The ErrorOccurred
/// transition time starts the backoff clock read by [`error_policy`].
async fn record_pass_error(appset: &ApplicationSet, error: &Error, ctx: &Context) {
    if error.is_not_found() {
        return;
    }
    let Some(namespace) = appset.namespace() else {
        return;
    };

    let status = appset
        .status
        .clone()
        .unwrap_or_default()
        .condition(Condition::new(
            CONDITION_RESOURCES_UP_TO_DATE,
            ConditionStatus::False,
            "ApplicationSetNotUpToDate",
            "reconciliation pass did not complete",
        ))
        .condition(Condition::new(
            CONDITION_ERROR_OCCURRED,
            ConditionStatus::True,
            "ApplicationSetError",
            error.to_string(),
        ));
    if appset.status.as_ref() == Some(&status) {
        return;
    }

    if let Err(patch_error) = ctx
        .client
        .patch_status(&namespace, &appset.name_any(), &status)
        .await
    {
        warn!(error = %patch_error, "failed to record pass error in status");
    }
}

/// Error policy for the controller
///
/// Transient errors back off by how long the set has been failing; anything
/// else waits the maximum delay since it needs a spec or cluster change.
pub fn error_policy(appset: Arc<ApplicationSet>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = if error.is_transient() {
        failure_delay(appset.status.as_ref(), &ctx.config)
    } else {
        ctx.config.failure_backoff_max
    };

    error!(
        ?error,
        appset = %appset.name_any(),
        delay_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

fn failure_delay(status: Option<&ApplicationSetStatus>, config: &ControllerConfig) -> Duration {
    let failing_for = status
        .and_then(ApplicationSetStatus::failing_since)
        .and_then(|since| (Utc::now() - since).to_std().ok())
        .unwrap_or_default();
    requeue_delay(
        failing_for,
        config.failure_backoff_base,
        config.failure_backoff_max,
    )
}

async fn reconcile_pass(appset: &ApplicationSet, ctx: &Context) -> Result<Action, Error> {
    let namespace = appset
        .namespace()
        .ok_or(Error::MissingField("metadata.namespace"))?;
    let name = appset.name_any();

    // The watch event may be stale; act on what the API server has now
    let Some(current) = ctx.client.get_appset(&namespace, &name).await? else {
        debug!("applicationset no longer exists");
        return Ok(Action::await_change());
    };

    if current.meta().deletion_timestamp.is_some() {
        finalize(&current, ctx).await?;
        return Ok(Action::await_change());
    }

    sync_finalizer(&current, ctx).await?;

    let report = run_pass(&current, ctx).await?;
    let status = pass_status(&current, &report);

    // An identical status is not written, so a steady set causes no watch events
    if current.status.as_ref() != Some(&status) {
        ctx.client.patch_status(&namespace, &name, &status).await?;
    }

    if report.has_failures() {
        let delay = failure_delay(Some(&status), &ctx.config);
        warn!(
            failures = report.failures.len(),
            applied = report.applied(),
            delay_secs = delay.as_secs(),
            "pass finished with failures"
        );
        Ok(Action::requeue(delay))
    } else {
        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            unchanged = report.unchanged,
            "applicationset reconciled"
        );
        Ok(Action::requeue(ctx.config.resync_interval))
    }
}

/// Run generators, render, compare and apply for one ApplicationSet.
///
/// Errors returned here are infrastructure failures that leave the pass
/// without a view of the live state; everything else is in the report.
pub async fn run_pass(appset: &ApplicationSet, ctx: &Context) -> Result<PassReport, Error> {
    let namespace = appset
        .namespace()
        .ok_or(Error::MissingField("metadata.namespace"))?;
    let uid = appset.uid().ok_or(Error::MissingField("metadata.uid"))?;
    let mut report = PassReport::default();

    let generated = ctx.generators.generate_all(appset).await;
    report.generator_failures = generated.failures.len();
    for failure in generated.failures {
        report.fail(
            FailedUnit::Generator {
                index: failure.index,
                kind: failure.kind,
            },
            failure.error,
        );
    }

    let desired = render_desired(appset, &namespace, &generated.params, ctx, &mut report);
    let live = ctx.client.list_owned(&namespace, &uid).await?;

    let plan = plan::plan(desired, live, report.desired_is_complete());
    report.unchanged = plan.unchanged.len();

    let mut managed: BTreeSet<String> = plan.unchanged.into_iter().collect();
    let client = &ctx.client;
    let outcomes: Vec<(Operation, Result<(), Error>)> = stream::iter(plan.operations)
        .map(|op| async move {
            let result = apply(client.as_ref(), &op).await;
            (op, result)
        })
        .buffer_unordered(ctx.config.apply_concurrency.max(1))
        .collect()
        .await;

    for (op, result) in outcomes {
        let name = op.name();
        match (op, result) {
            (op, Ok(())) => {
                info!(application = %name, action = op.verb(), "applied");
                match op {
                    Operation::Create(_) => report.created.push(name.clone()),
                    Operation::Update(_) => report.updated.push(name.clone()),
                    Operation::Delete(_) => report.deleted.push(name.clone()),
                }
                if !matches!(op, Operation::Delete(_)) {
                    managed.insert(name);
                }
            }
            (op, Err(error)) => {
                warn!(application = %name, action = op.verb(), %error, "apply failed");
                // A failed create leaves nothing behind; the others leave the live object
                if !matches!(op, Operation::Create(_)) {
                    managed.insert(name.clone());
                }
                report.fail(FailedUnit::Application(name), error);
            }
        }
    }

    report.created.sort();
    report.updated.sort();
    report.deleted.sort();
    report.failures.sort_by(|a, b| a.unit.cmp(&b.unit));
    report.managed = managed.into_iter().collect();
    Ok(report)
}

async fn apply(client: &dyn AppSetClient, op: &Operation) -> Result<(), Error> {
    match op {
        Operation::Create(app) => client.create_application(app).await,
        Operation::Update(app) => client.replace_application(app).await,
        Operation::Delete(app) => {
            let namespace = app
                .namespace()
                .ok_or(Error::MissingField("metadata.namespace"))?;
            client.delete_application(&namespace, &app.name_any()).await
        }
    }
}

/// Render one Application per parameter set; the first of two equal names wins
fn render_desired(
    appset: &ApplicationSet,
    namespace: &str,
    params: &[Params],
    ctx: &Context,
    report: &mut PassReport,
) -> Vec<Application> {
    let mut seen = HashSet::new();
    let mut desired = Vec::with_capacity(params.len());

    for (index, params) in params.iter().enumerate() {
        match desired_application(appset, namespace, &ctx.renderer, params) {
            Ok(app) => {
                let name = app.name_any();
                if seen.insert(name.clone()) {
                    desired.push(app);
                } else {
                    warn!(application = %name, index, "duplicate application name");
                    report.fail(
                        FailedUnit::Params {
                            index,
                            application: Some(name.clone()),
                        },
                        Error::DuplicateName { name },
                    );
                }
            }
            Err(error) => {
                warn!(index, %error, "failed to render application");
                report.render_failures += 1;
                report.fail(
                    FailedUnit::Params {
                        index,
                        application: None,
                    },
                    error,
                );
            }
        }
    }

    desired
}

/// Rendered Application placed in the set's namespace and controlled by the set
fn desired_application(
    appset: &ApplicationSet,
    namespace: &str,
    renderer: &Renderer,
    params: &Params,
) -> Result<Application, Error> {
    let mut app = renderer.render(&appset.spec.template, params)?;

    let rendered_namespace = app.metadata.namespace.clone();
    match rendered_namespace {
        None => app.metadata.namespace = Some(namespace.to_string()),
        Some(ns) if ns == namespace => {}
        Some(ns) => {
            return Err(Error::validation(format!(
                "application {} renders into namespace {ns}; owner references cannot cross \
                 namespaces and the ApplicationSet lives in {namespace}",
                app.name_any()
            )));
        }
    }

    let owner = appset
        .controller_owner_ref(&())
        .ok_or(Error::MissingField("metadata.uid"))?;
    app.metadata.owner_references = Some(vec![owner]);
    Ok(app)
}

fn pass_status(current: &ApplicationSet, report: &PassReport) -> ApplicationSetStatus {
    let parameters = if report.generator_failures == 0 {
        Condition::new(
            CONDITION_PARAMETERS_GENERATED,
            ConditionStatus::True,
            "ParametersGenerated",
            "Successfully generated parameters for all generators",
        )
    } else {
        Condition::new(
            CONDITION_PARAMETERS_GENERATED,
            ConditionStatus::False,
            "GeneratorError",
            format!("{} generator(s) failed", report.generator_failures),
        )
    };

    let (up_to_date, error) = if report.has_failures() {
        (
            Condition::new(
                CONDITION_RESOURCES_UP_TO_DATE,
                ConditionStatus::False,
                "ApplicationSetNotUpToDate",
                format!("{} unit(s) failed", report.failures.len()),
            ),
            Condition::new(
                CONDITION_ERROR_OCCURRED,
                ConditionStatus::True,
                "ApplicationSetError",
                failure_summary(&report.failures),
            ),
        )
    } else {
        (
            Condition::new(
                CONDITION_RESOURCES_UP_TO_DATE,
                ConditionStatus::True,
                "ApplicationSetUpToDate",
                "All applications have been generated successfully",
            ),
            Condition::new(
                CONDITION_ERROR_OCCURRED,
                ConditionStatus::False,
                "NoError",
                "",
            ),
        )
    };

    ApplicationSetStatus::from_previous(current.status.as_ref())
        .condition(parameters)
        .condition(up_to_date)
        .condition(error)
        .applications(report.managed.clone())
        .observed_generation(current.meta().generation)
}

fn failure_summary(failures: &[UnitFailure]) -> String {
    let mut lines: Vec<String> = failures
        .iter()
        .take(MAX_REPORTED_FAILURES)
        .map(ToString::to_string)
        .collect();
    if failures.len() > MAX_REPORTED_FAILURES {
        lines.push(format!("and {} more", failures.len() - MAX_REPORTED_FAILURES));
    }
    lines.join("; ")
}

/// Keep the preserve finalizer exactly when the sync policy asks for it
async fn sync_finalizer(appset: &ApplicationSet, ctx: &Context) -> Result<(), Error> {
    let has = appset.finalizers().iter().any(|f| f == PRESERVE_FINALIZER);
    let wants = appset.spec.preserves_resources_on_deletion();

    if wants && !has {
        debug!("adding preserve finalizer");
        ctx.client.add_finalizer(appset, PRESERVE_FINALIZER).await?;
    } else if has && !wants {
        debug!("removing preserve finalizer");
        ctx.client.remove_finalizer(appset, PRESERVE_FINALIZER).await?;
    }
    Ok(())
}

/// Release a deleted ApplicationSet.
///
/// Without the preserve finalizer there is nothing to do: garbage collection
/// follows the owner references. With it, owned Applications are orphaned
/// first when the policy still asks for preservation.
async fn finalize(appset: &ApplicationSet, ctx: &Context) -> Result<(), Error> {
    if !appset.finalizers().iter().any(|f| f == PRESERVE_FINALIZER) {
        debug!("deletion handled by garbage collection");
        return Ok(());
    }

    if appset.spec.preserves_resources_on_deletion() {
        let namespace = appset
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        let uid = appset.uid().ok_or(Error::MissingField("metadata.uid"))?;

        let owned = ctx.client.list_owned(&namespace, &uid).await?;
        for app in &owned {
            ctx.client.orphan_application(app, &uid).await?;
        }
        info!(count = owned.len(), "orphaned applications before deletion");
    }

    ctx.client.remove_finalizer(appset, PRESERVE_FINALIZER).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::{is_owned_by, MockAppSetClient};
    use crate::crd::{
        ApplicationDestination, ApplicationSetSpec, ApplicationSetSyncPolicy, ApplicationSource,
        ApplicationSpec, ApplicationTemplate, ApplicationTemplateMeta, GeneratorSpec, ListElement,
        ListGenerator,
    };
    use crate::error::api_error;
    use crate::generators::MockGenerator;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ===== In-memory API server =====

    /// Stateful stand-in for the API server, so behavior across passes can
    /// be observed. Every status patch is recorded.
    #[derive(Default)]
    struct FakeCluster {
        appset: Mutex<Option<ApplicationSet>>,
        apps: Mutex<BTreeMap<String, Application>>,
        statuses: Mutex<Vec<ApplicationSetStatus>>,
        orphaned: Mutex<Vec<String>>,
        fail_create: Mutex<HashSet<String>>,
        writes: AtomicUsize,
        next_uid: AtomicUsize,
        get_delay: Option<Duration>,
    }

    impl FakeCluster {
        fn with(appset: ApplicationSet) -> Arc<Self> {
            Arc::new(Self {
                appset: Mutex::new(Some(appset)),
                ..Default::default()
            })
        }

        fn stored(&self) -> ApplicationSet {
            self.appset.lock().unwrap().clone().expect("appset stored")
        }

        fn edit(&self, f: impl FnOnce(&mut ApplicationSet)) {
            if let Some(appset) = self.appset.lock().unwrap().as_mut() {
                f(appset);
            }
        }

        fn app_names(&self) -> Vec<String> {
            self.apps.lock().unwrap().keys().cloned().collect()
        }

        fn app(&self, name: &str) -> Application {
            self.apps.lock().unwrap().get(name).cloned().expect("application stored")
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        fn status_patches(&self) -> usize {
            self.statuses.lock().unwrap().len()
        }

        fn last_status(&self) -> ApplicationSetStatus {
            self.statuses.lock().unwrap().last().cloned().expect("status patched")
        }
    }

    #[async_trait]
    impl AppSetClient for FakeCluster {
        async fn get_appset(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<Option<ApplicationSet>, Error> {
            if let Some(delay) = self.get_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.appset.lock().unwrap().clone())
        }

        async fn list_owned(
            &self,
            _namespace: &str,
            owner_uid: &str,
        ) -> Result<Vec<Application>, Error> {
            Ok(self
                .apps
                .lock()
                .unwrap()
                .values()
                .filter(|app| is_owned_by(app, owner_uid))
                .cloned()
                .collect())
        }

        async fn create_application(&self, app: &Application) -> Result<(), Error> {
            let name = app.name_any();
            if self.fail_create.lock().unwrap().contains(&name) {
                return Err(api_error(500));
            }
            let mut apps = self.apps.lock().unwrap();
            if apps.contains_key(&name) {
                return Err(api_error(409));
            }
            let mut stored = app.clone();
            let uid = self.next_uid.fetch_add(1, Ordering::SeqCst);
            stored.metadata.uid = Some(format!("app-uid-{uid}"));
            stored.metadata.resource_version = Some("1".to_string());
            apps.insert(name, stored);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn replace_application(&self, app: &Application) -> Result<(), Error> {
            let name = app.name_any();
            let mut apps = self.apps.lock().unwrap();
            let Some(live) = apps.get(&name) else {
                return Err(api_error(404));
            };
            if live.metadata.resource_version != app.metadata.resource_version {
                return Err(api_error(409));
            }
            let version: u64 = live
                .metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let mut stored = app.clone();
            stored.metadata.resource_version = Some((version + 1).to_string());
            apps.insert(name, stored);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_application(&self, _namespace: &str, name: &str) -> Result<(), Error> {
            self.apps.lock().unwrap().remove(name);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn patch_status(
            &self,
            _namespace: &str,
            _name: &str,
            status: &ApplicationSetStatus,
        ) -> Result<(), Error> {
            self.edit(|appset| appset.status = Some(status.clone()));
            self.statuses.lock().unwrap().push(status.clone());
            Ok(())
        }

        async fn add_finalizer(&self, _appset: &ApplicationSet, finalizer: &str) -> Result<(), Error> {
            self.edit(|appset| {
                appset
                    .metadata
                    .finalizers
                    .get_or_insert_with(Vec::new)
                    .push(finalizer.to_string())
            });
            Ok(())
        }

        async fn remove_finalizer(
            &self,
            _appset: &ApplicationSet,
            finalizer: &str,
        ) -> Result<(), Error> {
            self.edit(|appset| {
                if let Some(finalizers) = appset.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != finalizer);
                }
            });
            Ok(())
        }

        async fn orphan_application(&self, app: &Application, owner_uid: &str) -> Result<(), Error> {
            let name = app.name_any();
            if let Some(stored) = self.apps.lock().unwrap().get_mut(&name) {
                if let Some(refs) = stored.metadata.owner_references.as_mut() {
                    refs.retain(|r| r.uid != owner_uid);
                }
            }
            self.orphaned.lock().unwrap().push(name);
            Ok(())
        }
    }

    // ===== Fixtures =====

    fn list_of(clusters: &[&str]) -> GeneratorSpec {
        GeneratorSpec {
            list: Some(ListGenerator {
                elements: clusters
                    .iter()
                    .map(|c| ListElement {
                        cluster: c.to_string(),
                        url: format!("https://{c}.example.com"),
                        values: BTreeMap::new(),
                    })
                    .collect(),
            }),
            ..Default::default()
        }
    }

    fn git_entry() -> GeneratorSpec {
        GeneratorSpec {
            git: Some(Default::default()),
            ..Default::default()
        }
    }

    fn template() -> ApplicationTemplate {
        ApplicationTemplate {
            metadata: ApplicationTemplateMeta {
                name: "${cluster}-guestbook".to_string(),
                labels: BTreeMap::from([("cluster".to_string(), "${cluster}".to_string())]),
                ..Default::default()
            },
            spec: ApplicationSpec {
                project: "default".to_string(),
                source: ApplicationSource {
                    repo_url: "https://github.com/argoproj/argocd-example-apps.git".to_string(),
                    path: Some("guestbook".to_string()),
                    target_revision: Some("HEAD".to_string()),
                    ..Default::default()
                },
                destination: ApplicationDestination {
                    server: Some("${url}".to_string()),
                    namespace: Some("guestbook".to_string()),
                    name: None,
                },
                sync_policy: None,
            },
        }
    }

    fn appset(generators: Vec<GeneratorSpec>) -> ApplicationSet {
        ApplicationSet {
            metadata: ObjectMeta {
                name: Some("guestbook".to_string()),
                namespace: Some("argocd".to_string()),
                uid: Some("uid-1".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: ApplicationSetSpec {
                generators,
                template: template(),
                sync_policy: None,
            },
            status: None,
        }
    }

    fn generators_with_git(git: MockGenerator) -> GeneratorSet {
        GeneratorSet::new(
            Arc::new(ListParamsGenerator::new()),
            Arc::new(MockGenerator::new()),
            Arc::new(git),
        )
    }

    fn list_only() -> GeneratorSet {
        generators_with_git(MockGenerator::new())
    }

    fn context(cluster: &Arc<FakeCluster>, generators: GeneratorSet) -> Arc<Context> {
        Context::for_testing(cluster.clone(), generators)
    }

    async fn pass(cluster: &Arc<FakeCluster>, ctx: &Arc<Context>) -> Result<Action, Error> {
        reconcile(Arc::new(cluster.stored()), ctx.clone()).await
    }

    // ===== Stories =====

    /// Story: with nothing changed outside the controller, the second pass
    /// writes nothing, not even status.
    #[tokio::test]
    async fn story_second_pass_is_idempotent() {
        let cluster = FakeCluster::with(appset(vec![list_of(&["dev", "prod"])]));
        let ctx = context(&cluster, list_only());

        let action = pass(&cluster, &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(ctx.config.resync_interval));
        assert_eq!(cluster.app_names(), vec!["dev-guestbook", "prod-guestbook"]);
        assert_eq!(cluster.writes(), 2);
        assert_eq!(cluster.status_patches(), 1);

        let report = run_pass(&cluster.stored(), &ctx).await.unwrap();
        assert_eq!(report.applied(), 0);
        assert_eq!(report.unchanged, 2);

        pass(&cluster, &ctx).await.unwrap();
        assert_eq!(cluster.writes(), 2);
        assert_eq!(cluster.status_patches(), 1);

        let status = cluster.last_status();
        assert_eq!(status.applications, vec!["dev-guestbook", "prod-guestbook"]);
        assert!(status.is_condition_true(CONDITION_RESOURCES_UP_TO_DATE));
        assert!(status.is_condition_true(CONDITION_PARAMETERS_GENERATED));
        assert!(!status.is_condition_true(CONDITION_ERROR_OCCURRED));
        assert_eq!(status.observed_generation, Some(1));
    }

    /// Story: the middle one of three generators fails; the other two still
    /// produce their Applications and exactly one failure is recorded.
    #[tokio::test]
    async fn story_failing_generator_is_isolated() {
        let mut git = MockGenerator::new();
        git.expect_generate_params()
            .returning(|_, _| Err(Error::generator("git", "repository not found")));
        let cluster = FakeCluster::with(appset(vec![list_of(&["a"]), git_entry(), list_of(&["c"])]));
        let ctx = context(&cluster, generators_with_git(git));

        let report = run_pass(&cluster.stored(), &ctx).await.unwrap();

        assert_eq!(report.created, vec!["a-guestbook", "c-guestbook"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit.to_string(), "generators[1] (git)");
        assert_eq!(report.generator_failures, 1);
    }

    /// Story: a failing pass records the failure in status and backs off
    /// instead of resyncing on the normal interval.
    #[tokio::test]
    async fn story_failures_surface_in_status_and_back_off() {
        let mut git = MockGenerator::new();
        git.expect_generate_params()
            .returning(|_, _| Err(Error::generator("git", "repository not found")));
        let cluster = FakeCluster::with(appset(vec![list_of(&["a"]), git_entry()]));
        let ctx = context(&cluster, generators_with_git(git));

        let action = pass(&cluster, &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(ctx.config.failure_backoff_base));

        let status = cluster.last_status();
        assert!(!status.is_condition_true(CONDITION_PARAMETERS_GENERATED));
        assert!(!status.is_condition_true(CONDITION_RESOURCES_UP_TO_DATE));
        let error = status.get_condition(CONDITION_ERROR_OCCURRED).unwrap();
        assert_eq!(error.status, ConditionStatus::True);
        assert!(error.message.contains("generators[1] (git)"));
        assert!(error.message.contains("repository not found"));

        // Same failure again: status is identical and is not rewritten
        pass(&cluster, &ctx).await.unwrap();
        assert_eq!(cluster.status_patches(), 1);
    }

    /// Story: two generators render the same name; the first one wins and
    /// the second is reported as a conflict.
    #[tokio::test]
    async fn story_duplicate_name_first_wins() {
        let mut second = list_of(&["dev"]);
        if let Some(list) = second.list.as_mut() {
            list.elements[0].url = "https://other.example.com".to_string();
        }
        let cluster = FakeCluster::with(appset(vec![list_of(&["dev"]), second]));
        let ctx = context(&cluster, list_only());

        let report = run_pass(&cluster.stored(), &ctx).await.unwrap();

        assert_eq!(report.created, vec!["dev-guestbook"]);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0].error,
            Error::DuplicateName { name } if name == "dev-guestbook"
        ));
        let app = cluster.app("dev-guestbook");
        assert_eq!(
            app.spec.destination.server.as_deref(),
            Some("https://dev.example.com")
        );
    }

    /// Story: a list element is removed; its Application is deleted on the
    /// next pass and the remaining one is left untouched.
    #[tokio::test]
    async fn story_removed_element_deletes_its_application() {
        let cluster = FakeCluster::with(appset(vec![list_of(&["dev", "prod"])]));
        let ctx = context(&cluster, list_only());
        pass(&cluster, &ctx).await.unwrap();
        let prod_before = cluster.app("prod-guestbook");

        cluster.edit(|appset| appset.spec.generators = vec![list_of(&["prod"])]);
        let report = run_pass(&cluster.stored(), &ctx).await.unwrap();

        assert_eq!(report.deleted, vec!["dev-guestbook"]);
        assert!(report.created.is_empty() && report.updated.is_empty());
        assert_eq!(cluster.app_names(), vec!["prod-guestbook"]);
        assert_eq!(cluster.app("prod-guestbook"), prod_before);
        assert_eq!(report.managed, vec!["prod-guestbook"]);
    }

    /// Story: while a generator is failing, Applications it produced earlier
    /// are kept rather than deleted.
    #[tokio::test]
    async fn story_failing_generator_does_not_delete_its_applications() {
        let cluster = FakeCluster::with(appset(vec![list_of(&["dev"]), git_entry()]));
        let mut git = MockGenerator::new();
        git.expect_generate_params()
            .returning(|_, _| Ok(Some(vec![Params::from([
                ("cluster".to_string(), "git".to_string()),
                ("url".to_string(), "https://git.example.com".to_string()),
            ])])));
        pass(&cluster, &context(&cluster, generators_with_git(git)))
            .await
            .unwrap();
        assert_eq!(cluster.app_names(), vec!["dev-guestbook", "git-guestbook"]);

        let mut broken = MockGenerator::new();
        broken
            .expect_generate_params()
            .returning(|_, _| Err(Error::repo_server("Unavailable: connection refused")));
        let report = run_pass(&cluster.stored(), &context(&cluster, generators_with_git(broken)))
            .await
            .unwrap();

        assert!(report.deleted.is_empty());
        assert_eq!(cluster.app_names(), vec!["dev-guestbook", "git-guestbook"]);
        assert_eq!(report.managed, vec!["dev-guestbook", "git-guestbook"]);
    }

    /// Story: a duplicate name that never goes away does not stop retired
    /// Applications from being deleted.
    #[tokio::test]
    async fn story_duplicate_name_does_not_block_deletes() {
        let cluster = FakeCluster::with(appset(vec![list_of(&["dev", "prod"]), list_of(&["dev"])]));
        let ctx = context(&cluster, list_only());
        pass(&cluster, &ctx).await.unwrap();
        assert_eq!(cluster.app_names(), vec!["dev-guestbook", "prod-guestbook"]);

        cluster.edit(|appset| appset.spec.generators = vec![list_of(&["dev"]), list_of(&["dev"])]);
        let report = run_pass(&cluster.stored(), &ctx).await.unwrap();

        assert_eq!(report.deleted, vec!["prod-guestbook"]);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].error, Error::DuplicateName { .. }));
        assert_eq!(cluster.app_names(), vec!["dev-guestbook"]);
    }

    /// Story: a hand-written multi-source Application lives next to the
    /// set's own; passes neither fail on it nor touch it.
    #[tokio::test]
    async fn story_foreign_application_is_left_alone() {
        let foreign: Application = serde_yaml::from_str(
            r#"
apiVersion: argoproj.io/v1alpha1
kind: Application
metadata:
  name: hand-written
  namespace: argocd
spec:
  project: platform
  sources:
    - repoURL: https://charts.example.com
      chart: redis
  destination:
    name: in-cluster
"#,
        )
        .unwrap();
        let cluster = FakeCluster::with(appset(vec![list_of(&["dev"])]));
        cluster
            .apps
            .lock()
            .unwrap()
            .insert("hand-written".to_string(), foreign.clone());
        let ctx = context(&cluster, list_only());

        let action = pass(&cluster, &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(ctx.config.resync_interval));
        assert_eq!(cluster.last_status().applications, vec!["dev-guestbook"]);

        cluster.edit(|appset| appset.spec.generators = vec![list_of(&["prod"])]);
        let report = run_pass(&cluster.stored(), &ctx).await.unwrap();

        assert_eq!(report.deleted, vec!["dev-guestbook"]);
        assert_eq!(cluster.app_names(), vec!["hand-written", "prod-guestbook"]);
        assert_eq!(cluster.app("hand-written"), foreign);
    }

    /// Story: someone edits a managed Application by hand; the next pass
    /// restores it with a replace that keeps the live identity.
    #[tokio::test]
    async fn story_drift_is_reverted() {
        let cluster = FakeCluster::with(appset(vec![list_of(&["dev"])]));
        let ctx = context(&cluster, list_only());
        pass(&cluster, &ctx).await.unwrap();
        let uid = cluster.app("dev-guestbook").metadata.uid;

        if let Some(app) = cluster.apps.lock().unwrap().get_mut("dev-guestbook") {
            app.spec.source.path = Some("hand-edited".to_string());
        }
        let report = run_pass(&cluster.stored(), &ctx).await.unwrap();

        assert_eq!(report.updated, vec!["dev-guestbook"]);
        let app = cluster.app("dev-guestbook");
        assert_eq!(app.spec.source.path.as_deref(), Some("guestbook"));
        assert_eq!(app.metadata.uid, uid);
        assert_eq!(app.metadata.resource_version.as_deref(), Some("2"));
    }

    /// Story: with preserveResourcesOnDeletion, deleting the set orphans its
    /// Applications instead of letting them be garbage collected.
    #[tokio::test]
    async fn story_preserved_applications_survive_deletion() {
        let mut preserved = appset(vec![list_of(&["dev", "prod"])]);
        preserved.spec.sync_policy = Some(ApplicationSetSyncPolicy {
            preserve_resources_on_deletion: true,
        });
        let cluster = FakeCluster::with(preserved);
        let ctx = context(&cluster, list_only());

        pass(&cluster, &ctx).await.unwrap();
        assert_eq!(cluster.stored().finalizers(), [PRESERVE_FINALIZER.to_string()]);

        cluster.edit(|appset| appset.metadata.deletion_timestamp = Some(Time(Utc::now())));
        let writes = cluster.writes();
        let action = pass(&cluster, &ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(cluster.writes(), writes);
        assert_eq!(cluster.app_names(), vec!["dev-guestbook", "prod-guestbook"]);
        assert!(!is_owned_by(&cluster.app("dev-guestbook"), "uid-1"));
        assert_eq!(cluster.orphaned.lock().unwrap().len(), 2);
        assert!(cluster.stored().finalizers().is_empty());
    }

    // ===== Edge cases =====

    #[tokio::test]
    async fn test_namespace_mismatch_produces_no_application() {
        let mut foreign = appset(vec![list_of(&["dev"])]);
        foreign.spec.template.metadata.namespace = Some("other".to_string());
        let cluster = FakeCluster::with(foreign);
        let ctx = context(&cluster, list_only());

        let report = run_pass(&cluster.stored(), &ctx).await.unwrap();

        assert!(cluster.app_names().is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].error, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_rendered_application_is_owned_and_namespaced() {
        let cluster = FakeCluster::with(appset(vec![list_of(&["dev"])]));
        let ctx = context(&cluster, list_only());
        pass(&cluster, &ctx).await.unwrap();

        let app = cluster.app("dev-guestbook");
        assert_eq!(app.metadata.namespace.as_deref(), Some("argocd"));
        assert!(is_owned_by(&app, "uid-1"));
        assert_eq!(
            app.labels().get("cluster").map(String::as_str),
            Some("dev")
        );
    }

    #[tokio::test]
    async fn test_failed_create_is_not_managed() {
        let cluster = FakeCluster::with(appset(vec![list_of(&["dev", "prod"])]));
        cluster
            .fail_create
            .lock()
            .unwrap()
            .insert("prod-guestbook".to_string());
        let ctx = context(&cluster, list_only());

        let action = pass(&cluster, &ctx).await.unwrap();

        assert_eq!(action, Action::requeue(ctx.config.failure_backoff_base));
        let status = cluster.last_status();
        assert_eq!(status.applications, vec!["dev-guestbook"]);
        assert!(status
            .get_condition(CONDITION_ERROR_OCCURRED)
            .unwrap()
            .message
            .contains("application prod-guestbook"));
    }

    #[tokio::test]
    async fn test_missing_appset_is_done() {
        let mut client = MockAppSetClient::new();
        client.expect_get_appset().returning(|_, _| Ok(None));
        let ctx = Context::for_testing(Arc::new(client), list_only());

        let action = reconcile(Arc::new(appset(vec![])), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_list_failure_fails_the_pass() {
        let mut client = MockAppSetClient::new();
        client
            .expect_get_appset()
            .returning(|_, _| Ok(Some(appset(vec![list_of(&["dev"])]))));
        client
            .expect_list_owned()
            .returning(|_, _| Err(api_error(503)));
        client
            .expect_patch_status()
            .withf(|namespace, name, status| {
                namespace == "argocd"
                    && name == "guestbook"
                    && status.is_condition_true(CONDITION_ERROR_OCCURRED)
                    && status.applications == vec!["dev-guestbook".to_string()]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let ctx = Context::for_testing(Arc::new(client), list_only());

        let mut observed = appset(vec![]);
        observed.status = Some(ApplicationSetStatus::default().applications(vec!["dev-guestbook".to_string()]));
        let err = reconcile(Arc::new(observed), ctx).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_repeated_pass_error_is_not_rewritten() {
        let failed = ApplicationSetStatus::default().condition(Condition::new(
            CONDITION_ERROR_OCCURRED,
            ConditionStatus::True,
            "ApplicationSetError",
            "reconciliation timed out after 120s",
        ));
        let mut observed = appset(vec![]);
        observed.status = Some(failed.condition(Condition::new(
            CONDITION_RESOURCES_UP_TO_DATE,
            ConditionStatus::False,
            "ApplicationSetNotUpToDate",
            "reconciliation pass did not complete",
        )));
        let mut client = MockAppSetClient::new();
        client.expect_patch_status().never();
        let ctx = Context::for_testing(Arc::new(client), list_only());

        record_pass_error(&observed, &Error::Timeout(120), &ctx).await;
    }

    #[tokio::test]
    async fn test_gc_deletion_skips_orphaning() {
        let mut deleted = appset(vec![list_of(&["dev"])]);
        deleted.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let mut client = MockAppSetClient::new();
        client
            .expect_get_appset()
            .returning(move |_, _| Ok(Some(deleted.clone())));
        client.expect_orphan_application().never();
        client.expect_remove_finalizer().never();
        let ctx = Context::for_testing(Arc::new(client), list_only());

        let action = reconcile(Arc::new(appset(vec![])), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_finalizer_dropped_when_policy_turned_off() {
        let mut stale = appset(vec![]);
        stale.metadata.finalizers = Some(vec![PRESERVE_FINALIZER.to_string()]);
        let cluster = FakeCluster::with(stale);
        let ctx = context(&cluster, list_only());

        pass(&cluster, &ctx).await.unwrap();

        assert!(cluster.stored().finalizers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_is_bounded_by_timeout() {
        let cluster = Arc::new(FakeCluster {
            appset: Mutex::new(Some(appset(vec![list_of(&["dev"])]))),
            get_delay: Some(Duration::from_secs(600)),
            ..Default::default()
        });
        let ctx = context(&cluster, list_only());

        let err = pass(&cluster, &ctx).await.unwrap_err();

        assert!(matches!(err, Error::Timeout(120)));
        assert!(cluster.app_names().is_empty());

        let status = cluster.last_status();
        assert!(!status.is_condition_true(CONDITION_RESOURCES_UP_TO_DATE));
        let error = status.get_condition(CONDITION_ERROR_OCCURRED).unwrap();
        assert_eq!(error.status, ConditionStatus::True);
        assert!(error.message.contains("timed out after 120s"));
    }

    #[rstest]
    #[case(Error::RepoServer("Unavailable".to_string()), 10)]
    #[case(Error::Timeout(120), 10)]
    #[case(Error::MissingField("metadata.uid"), 300)]
    fn test_error_policy_delay(#[case] error: Error, #[case] secs: u64) {
        let ctx = Context::for_testing(Arc::new(MockAppSetClient::new()), list_only());
        let action = error_policy(Arc::new(appset(vec![])), &error, ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(secs)));
    }

    #[test]
    fn test_error_policy_grows_with_failure_age() {
        let mut failing = appset(vec![]);
        let mut condition = Condition::new(
            CONDITION_ERROR_OCCURRED,
            ConditionStatus::True,
            "ApplicationSetError",
            "boom",
        );
        condition.last_transition_time = Utc::now() - chrono::Duration::seconds(90);
        failing.status = Some(ApplicationSetStatus {
            conditions: vec![condition],
            ..Default::default()
        });
        let config = ControllerConfig::default();

        let delay = failure_delay(failing.status.as_ref(), &config);
        assert!(delay >= Duration::from_secs(89) && delay <= Duration::from_secs(91));
    }

    #[tokio::test]
    async fn test_failures_are_ordered_by_position() {
        let clusters: Vec<String> = (0..11).map(|i| format!("c{i}")).collect();
        let clusters: Vec<&str> = clusters.iter().map(String::as_str).collect();
        let mut entry = list_of(&clusters);
        if let Some(list) = entry.list.as_mut() {
            for (i, element) in list.elements.iter_mut().enumerate() {
                if i != 2 && i != 10 {
                    element.values.insert("revision".to_string(), "main".to_string());
                }
            }
        }
        let mut revisioned = appset(vec![entry]);
        revisioned.spec.template.metadata.annotations =
            BTreeMap::from([("revision".to_string(), "${values.revision}".to_string())]);
        let cluster = FakeCluster::with(revisioned);
        let ctx = context(&cluster, list_only());

        let report = run_pass(&cluster.stored(), &ctx).await.unwrap();

        let units: Vec<String> = report.failures.iter().map(|f| f.unit.to_string()).collect();
        assert_eq!(units, vec!["params[2]", "params[10]"]);
        assert!(failure_summary(&report.failures).starts_with("params[2]: "));
    }

    #[test]
    fn test_failed_units_order_by_kind_then_index() {
        let mut units = vec![
            FailedUnit::Application("a-guestbook".to_string()),
            FailedUnit::Params {
                index: 10,
                application: None,
            },
            FailedUnit::Generator {
                index: 3,
                kind: "git",
            },
            FailedUnit::Params {
                index: 9,
                application: Some("dev-guestbook".to_string()),
            },
        ];
        units.sort();

        let shown: Vec<String> = units.iter().map(ToString::to_string).collect();
        assert_eq!(
            shown,
            vec![
                "generators[3] (git)",
                "params[9] application dev-guestbook",
                "params[10]",
                "application a-guestbook",
            ]
        );
    }

    #[test]
    fn test_failure_summary_is_bounded() {
        let failures: Vec<UnitFailure> = (0..7)
            .map(|i| UnitFailure {
                unit: FailedUnit::Params {
                    index: i,
                    application: None,
                },
                error: Error::validation("bad"),
            })
            .collect();
        let summary = failure_summary(&failures);
        assert!(summary.starts_with("params[0]: validation error: bad"));
        assert!(summary.ends_with("and 2 more"));
    }
}
