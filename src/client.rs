//! The resource-store seam between the reconciler and the cluster.
//!
//! The reconciler only talks to the cluster through [`CappKubeClient`], so
//! tests can substitute an in-memory cluster or a mock.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy},
};
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::{
    crd::{Capp, CappConfig, CappStatus},
    error::Error,
    knative::{KnativeService, Revision, SERVICE_LABEL},
};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CappKubeClient: Send + Sync {
    /// Fetch the CappConfig holding cluster-wide defaults, if installed.
    async fn get_capp_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CappConfig>, Error>;

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KnativeService>, Error>;

    /// Fails with `AlreadyExists` if a Service of that name exists.
    async fn create_service(&self, service: &KnativeService) -> Result<KnativeService, Error>;

    /// Fails with `Conflict` if `service` carries a stale `resourceVersion`.
    async fn replace_service(&self, service: &KnativeService) -> Result<KnativeService, Error>;

    /// Idempotent: deleting an absent Service succeeds.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Revisions stamped from the Service named `service`.
    async fn list_revisions(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<Revision>, Error>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    async fn patch_capp_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CappStatus,
    ) -> Result<(), Error>;

    /// Replace the finalizer list, guarded by `resource_version` when given.
    async fn patch_capp_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;
}

/// [`CappKubeClient`] backed by the Kubernetes API.
pub struct CappKubeClientImpl {
    client: Client,
    field_manager: String,
}

impl CappKubeClientImpl {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn services(&self, namespace: &str) -> Api<KnativeService> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn capps(&self, namespace: &str) -> Api<Capp> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn service_identity(service: &KnativeService) -> Result<(&str, &str), Error> {
    let name = service.metadata.name.as_deref();
    let namespace = service.metadata.namespace.as_deref();
    match (namespace, name) {
        (Some(namespace), Some(name)) => Ok((namespace, name)),
        _ => Err(Error::InvariantViolation(
            "Service is missing name or namespace".to_string(),
        )),
    }
}

/// Merge patch replacing the whole status. Unset optional fields are sent as
/// `null`, otherwise the merge would keep their previous values.
fn status_merge_patch(status: &CappStatus) -> Result<Value, Error> {
    let mut value = serde_json::to_value(status)?;
    clear_unset(&mut value, &["state", "conditions", "observedGeneration"]);
    if let Some(knative) = value.get_mut("knativeObjectStatus") {
        clear_unset(
            knative,
            &["url", "latestReadyRevisionName", "latestCreatedRevisionName"],
        );
    }
    Ok(serde_json::json!({ "status": value }))
}

fn clear_unset(value: &mut Value, keys: &[&str]) {
    if let Value::Object(map) = value {
        for key in keys {
            map.entry(*key).or_insert(Value::Null);
        }
    }
}

#[async_trait]
impl CappKubeClient for CappKubeClientImpl {
    async fn get_capp_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CappConfig>, Error> {
        let api: Api<CappConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KnativeService>, Error> {
        Ok(self.services(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, service: &KnativeService) -> Result<KnativeService, Error> {
        let (namespace, _) = service_identity(service)?;
        Ok(self
            .services(namespace)
            .create(&self.post_params(), service)
            .await?)
    }

    async fn replace_service(&self, service: &KnativeService) -> Result<KnativeService, Error> {
        let (namespace, name) = service_identity(service)?;
        Ok(self
            .services(namespace)
            .replace(name, &self.post_params(), service)
            .await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        match self.services(namespace).delete(name, &dp).await.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_revisions(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<Revision>, Error> {
        let api: Api<Revision> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{SERVICE_LABEL}={service}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_capp_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CappStatus,
    ) -> Result<(), Error> {
        let patch = status_merge_patch(status)?;
        self.capps(namespace)
            .patch_status(
                name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn patch_capp_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let mut metadata = serde_json::json!({ "finalizers": finalizers });
        if let Some(resource_version) = resource_version {
            metadata["resourceVersion"] = resource_version.into();
        }
        let patch = serde_json::json!({ "metadata": metadata });
        self.capps(namespace)
            .patch(
                name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
