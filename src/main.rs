//! appset - ApplicationSet controller for Argo CD

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use appset::config::ControllerConfig;
use appset::controller::{error_policy, reconcile, Context};
use appset::crd::{Application, ApplicationSet};
use appset::telemetry::{self, LogFormat};
use appset::{DEFAULT_ARGOCD_NAMESPACE, DEFAULT_REPO_SERVER, DEFAULT_REPO_SERVER_MAX_CONNECTIONS};

/// appset - generate and keep Argo CD Applications in sync from ApplicationSets
#[derive(Parser, Debug)]
#[command(name = "appset", version, about, long_about = None)]
struct Cli {
    /// Print the ApplicationSet CRD and exit
    #[arg(long)]
    crd: bool,

    /// Apply the ApplicationSet CRD on startup
    #[arg(long)]
    install_crd: bool,

    /// Repository server gRPC address
    #[arg(long, env = "ARGOCD_REPOSERVER_ADDR", default_value = DEFAULT_REPO_SERVER)]
    repo_server: String,

    /// Per-call timeout for repository server requests, in seconds
    #[arg(long, default_value = "60")]
    repo_server_timeout_secs: u64,

    /// Concurrent requests to the repository server
    #[arg(long, default_value_t = DEFAULT_REPO_SERVER_MAX_CONNECTIONS)]
    repo_server_max_connections: usize,

    /// Namespace holding Argo CD cluster secrets
    #[arg(long, env = "ARGOCD_NAMESPACE", default_value = DEFAULT_ARGOCD_NAMESPACE)]
    argocd_namespace: String,

    /// Only watch ApplicationSets in this namespace
    #[arg(long, env = "APPSET_NAMESPACE")]
    namespace: Option<String>,

    /// Time budget for one reconciliation pass, in seconds
    #[arg(long, default_value = "120")]
    pass_timeout_secs: u64,

    /// Concurrent Application writes within one pass
    #[arg(long, default_value = "8")]
    apply_concurrency: usize,

    /// Requeue interval after a successful pass, in seconds
    #[arg(long, default_value = "180")]
    resync_secs: u64,

    /// Log output format (text or json)
    #[arg(long, env = "APPSET_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            repo_server: self.repo_server.clone(),
            repo_server_timeout: Duration::from_secs(self.repo_server_timeout_secs),
            repo_server_max_connections: self.repo_server_max_connections,
            argocd_namespace: self.argocd_namespace.clone(),
            watch_namespace: self.namespace.clone(),
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
            apply_concurrency: self.apply_concurrency,
            resync_interval: Duration::from_secs(self.resync_secs),
            ..ControllerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ApplicationSet::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    telemetry::init(cli.log_format);
    run_controller(cli).await
}

/// Apply the ApplicationSet CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(appset::FIELD_MANAGER).force();

    tracing::info!("Installing ApplicationSet CRD...");
    crds.patch(
        "applicationsets.argoproj.io",
        &params,
        &Patch::Apply(&ApplicationSet::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ApplicationSet CRD: {}", e))?;
    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let config = cli.controller_config();
    tracing::info!(
        repo_server = %config.repo_server,
        argocd_namespace = %config.argocd_namespace,
        namespace = ?config.watch_namespace,
        "Starting ApplicationSet controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let (appsets, apps): (Api<ApplicationSet>, Api<Application>) = match &config.watch_namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let ctx = Arc::new(
        Context::new(client, config)
            .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?,
    );

    Controller::new(appsets, WatcherConfig::default())
        .owns(apps, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((appset, action)) => {
                    tracing::debug!(appset = %appset.name, ?action, "ApplicationSet reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "ApplicationSet reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("ApplicationSet controller shutting down");
    Ok(())
}
