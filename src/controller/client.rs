//! Kubernetes client seam for the ApplicationSet controller
//!
//! Every API call a reconciliation pass makes goes through [`AppSetClient`],
//! so passes can be driven against mocks or an in-memory store in tests.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Application, ApplicationSet, ApplicationSetStatus};
use crate::{Error, FIELD_MANAGER};

/// Trait abstracting the API operations of a reconciliation pass
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppSetClient: Send + Sync {
    /// Read an ApplicationSet; `None` when it no longer exists
    async fn get_appset(&self, namespace: &str, name: &str)
        -> Result<Option<ApplicationSet>, Error>;

    /// List Applications in `namespace` whose controller owner has `owner_uid`
    async fn list_owned(&self, namespace: &str, owner_uid: &str)
        -> Result<Vec<Application>, Error>;

    /// Create an Application
    async fn create_application(&self, app: &Application) -> Result<(), Error>;

    /// Replace an Application; `app` must carry the live resourceVersion
    async fn replace_application(&self, app: &Application) -> Result<(), Error>;

    /// Delete an Application; an already deleted one is success
    async fn delete_application(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Merge-patch the status subresource of an ApplicationSet
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ApplicationSetStatus,
    ) -> Result<(), Error>;

    /// Add `finalizer` to an ApplicationSet if missing
    async fn add_finalizer(&self, appset: &ApplicationSet, finalizer: &str) -> Result<(), Error>;

    /// Remove `finalizer` from an ApplicationSet if present
    async fn remove_finalizer(&self, appset: &ApplicationSet, finalizer: &str)
        -> Result<(), Error>;

    /// Drop the owner reference to `owner_uid` so garbage collection skips `app`
    async fn orphan_application(&self, app: &Application, owner_uid: &str) -> Result<(), Error>;
}

/// Whether `app` is controlled by the owner with `owner_uid`
pub fn is_owned_by(app: &Application, owner_uid: &str) -> bool {
    app.owner_references()
        .iter()
        .any(|r| r.uid == owner_uid && r.controller == Some(true))
}

/// Keep the Applications controlled by `owner_uid`.
///
/// Applications in the namespace that belong to someone else are listed too,
/// so they must only ever be filtered here, never acted on.
fn owned_by(apps: Vec<Application>, owner_uid: &str) -> Vec<Application> {
    apps.into_iter()
        .filter(|app| is_owned_by(app, owner_uid))
        .collect()
}

/// Owner references of `app` without the ones pointing at `owner_uid`
fn references_without(app: &Application, owner_uid: &str) -> Vec<OwnerReference> {
    app.owner_references()
        .iter()
        .filter(|r| r.uid != owner_uid)
        .cloned()
        .collect()
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn applications(&self, namespace: &str) -> Api<Application> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn appsets(&self, namespace: &str) -> Api<ApplicationSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    async fn patch_finalizers(
        &self,
        appset: &ApplicationSet,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let namespace = appset
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        // resourceVersion turns the merge patch into a compare-and-swap
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": appset.resource_version(),
            }
        });

        self.appsets(&namespace)
            .patch(
                &appset.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AppSetClient for KubeClientImpl {
    async fn get_appset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ApplicationSet>, Error> {
        Ok(self.appsets(namespace).get_opt(name).await?)
    }

    async fn list_owned(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Application>, Error> {
        let apps = self
            .applications(namespace)
            .list(&ListParams::default())
            .await?;

        let owned = owned_by(apps.items, owner_uid);
        debug!(namespace, count = owned.len(), "listed owned applications");
        Ok(owned)
    }

    async fn create_application(&self, app: &Application) -> Result<(), Error> {
        let namespace = app
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        self.applications(&namespace)
            .create(&Self::post_params(), app)
            .await?;
        Ok(())
    }

    async fn replace_application(&self, app: &Application) -> Result<(), Error> {
        let namespace = app
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        self.applications(&namespace)
            .replace(&app.name_any(), &Self::post_params(), app)
            .await?;
        Ok(())
    }

    async fn delete_application(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .applications(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace, name, "application already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ApplicationSetStatus,
    ) -> Result<(), Error> {
        let status_patch = json!({ "status": status });

        self.appsets(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, appset: &ApplicationSet, finalizer: &str) -> Result<(), Error> {
        if appset.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let mut finalizers = appset.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(appset, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        appset: &ApplicationSet,
        finalizer: &str,
    ) -> Result<(), Error> {
        if !appset.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let finalizers = appset
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(appset, finalizers).await
    }

    async fn orphan_application(&self, app: &Application, owner_uid: &str) -> Result<(), Error> {
        let namespace = app
            .namespace()
            .ok_or(Error::MissingField("metadata.namespace"))?;
        let patch = json!({
            "metadata": {
                "ownerReferences": references_without(app, owner_uid),
                "resourceVersion": app.resource_version(),
            }
        });

        match self
            .applications(&namespace)
            .patch(
                &app.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
