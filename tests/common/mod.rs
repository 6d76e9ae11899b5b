//! In-memory cluster for driving the reconciler end to end.
//!
//! `FakeCluster` stores Capps, Knative Services, Revisions, Secrets and
//! CappConfigs, and plays the Knative serving controller: every template
//! change stamps out the next sequentially named Revision, whose readiness
//! depends on the image and on the referenced Secrets existing.

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::{
    ByteString,
    api::core::v1::{Container, Secret},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{ResourceExt, api::ObjectMeta};
use tokio::task::JoinHandle;

use capp_controller::{
    Error,
    client::CappKubeClient,
    config::Config,
    controller::{self, Context},
    crd::{AutoscaleConfig, Capp, CappConfig, CappConfigSpec, CappSpec, CappStatus},
    knative::{
        CONFIGURATION_GENERATION_LABEL, KnativeCondition, KnativeService, KnativeServiceStatus,
        Revision, RevisionCrdSpec, RevisionStatus, SERVICE_LABEL,
    },
    revision, secrets,
};

pub const NAMESPACE: &str = "capp-e2e";
pub const IMAGE: &str = "ghcr.io/dana-team/autoscale-go:v0.0.3";
pub const MISSING_IMAGE: &str = "ghcr.io/dana-team/non-existing-image:v0.0.0";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    resource_version: u64,
    capps: BTreeMap<Key, Capp>,
    services: BTreeMap<Key, KnativeService>,
    revisions: BTreeMap<Key, Revision>,
    secrets: BTreeMap<Key, Secret>,
    configs: BTreeMap<Key, CappConfig>,
    pending_conflicts: u32,
    service_writes: u64,
    status_writes: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn revisions_of(&self, namespace: &str, service: &str) -> Vec<Revision> {
        self.revisions
            .iter()
            .filter(|((ns, _), r)| {
                ns == namespace
                    && r.labels().get(SERVICE_LABEL).map(String::as_str) == Some(service)
            })
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn sorted_revisions(&self, namespace: &str, service: &str) -> Vec<Revision> {
        let mut revisions = self.revisions_of(namespace, service);
        revisions.sort_by_key(|r| r.name_any());
        revisions
    }

    /// Knative's side of a Service write: bump the generation on a spec
    /// change, stamp out a Revision and refresh the status.
    fn serve(&mut self, service: &mut KnativeService, previous: Option<&KnativeService>) {
        let ns = service.namespace().unwrap_or_default();
        let name = service.name_any();

        let spec_changed = previous.is_none_or(|p| p.spec != service.spec);
        let generation = match previous {
            Some(p) if !spec_changed => p.metadata.generation.unwrap_or(1),
            Some(p) => p.metadata.generation.unwrap_or(0) + 1,
            None => 1,
        };
        service.metadata.generation = Some(generation);

        if spec_changed {
            let latest = self.sorted_revisions(&ns, &name).last().map(|r| r.name_any());
            let revision_name = revision::next_revision_name(&name, &latest.unwrap_or_default())
                .unwrap_or_else(|| revision::revision_name(&name, 1));
            let revision = self.stamp_revision(service, &revision_name, generation);
            self.revisions.insert(key(&ns, &revision_name), revision);
        }

        let revisions = self.sorted_revisions(&ns, &name);
        let mut status = KnativeServiceStatus {
            observed_generation: Some(generation),
            url: Some(format!("https://{name}-{ns}.apps.example.com")),
            ..Default::default()
        };
        status.configuration_status_fields.latest_created_revision_name =
            revisions.last().map(|r| r.name_any());
        status.configuration_status_fields.latest_ready_revision_name = revisions
            .iter()
            .rev()
            .find(|r| r.is_ready())
            .map(|r| r.name_any());
        service.status = Some(status);
    }

    fn stamp_revision(
        &self,
        service: &KnativeService,
        name: &str,
        generation: i64,
    ) -> Revision {
        let ns = service.namespace().unwrap_or_default();
        let template = service.template();

        let mut labels = template.labels().cloned().unwrap_or_default();
        labels.insert(SERVICE_LABEL.to_string(), service.name_any());
        labels.insert(
            CONFIGURATION_GENERATION_LABEL.to_string(),
            generation.to_string(),
        );

        let mut revision = Revision::new(
            name,
            RevisionCrdSpec {
                spec: template.spec.clone(),
            },
        );
        revision.metadata.namespace = Some(ns.clone());
        revision.metadata.labels = Some(labels);
        revision.metadata.annotations = template.annotations().cloned();

        let pod_spec = &template.spec.pod_spec;
        let images_exist = pod_spec
            .containers
            .iter()
            .all(|c| c.image.as_deref().is_some_and(|i| i != MISSING_IMAGE));
        let secrets_exist = secrets::referenced_secrets(pod_spec)
            .iter()
            .all(|s| self.secrets.contains_key(&key(&ns, s)));
        let keys_resolve = pod_spec
            .containers
            .iter()
            .flat_map(|c| c.env.iter().flatten())
            .filter_map(|env| env.value_from.as_ref()?.secret_key_ref.as_ref())
            .all(|selector| {
                self.secrets
                    .get(&key(&ns, &selector.name))
                    .and_then(|secret| secret.data.as_ref())
                    .is_some_and(|data| data.contains_key(&selector.key))
            });
        let ready = images_exist && secrets_exist && keys_resolve;

        revision.status = Some(RevisionStatus {
            observed_generation: Some(1),
            conditions: vec![KnativeCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                reason: (!ready).then(|| "ContainerMissing".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });
        revision
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates the Capp, or updates its spec and metadata like `kubectl apply`.
    pub fn apply_capp(&self, capp: Capp) {
        let mut state = self.state();
        let version = state.next_version();
        let k = key(&capp.namespace().unwrap_or_default(), &capp.name_any());
        match state.capps.get_mut(&k) {
            Some(existing) => {
                if existing.spec.configuration_spec != capp.spec.configuration_spec
                    || existing.spec.scale_metric != capp.spec.scale_metric
                {
                    existing.metadata.generation = existing.metadata.generation.map(|g| g + 1);
                }
                existing.spec = capp.spec;
                existing.metadata.labels = capp.metadata.labels;
                existing.metadata.annotations = capp.metadata.annotations;
                existing.metadata.resource_version = Some(version);
            }
            None => {
                let mut capp = capp;
                capp.metadata.uid = Some(format!("uid-{}-{}", k.0, k.1));
                capp.metadata.generation = Some(1);
                capp.metadata.resource_version = Some(version);
                capp.status = None;
                state.capps.insert(k, capp);
            }
        }
    }

    pub fn update_capp(&self, name: &str, mutate: impl FnOnce(&mut Capp)) {
        let mut capp = self.capp(name).expect("capp exists");
        mutate(&mut capp);
        self.apply_capp(capp);
    }

    /// Marks the Capp for deletion, or removes it outright without finalizers.
    pub fn delete_capp(&self, name: &str) {
        let mut state = self.state();
        let k = key(NAMESPACE, name);
        let version = state.next_version();
        let Some(capp) = state.capps.get_mut(&k) else {
            return;
        };
        if capp.finalizers().is_empty() {
            state.capps.remove(&k);
        } else if capp.metadata.deletion_timestamp.is_none() {
            capp.metadata.deletion_timestamp = Some(Time(Utc::now()));
            capp.metadata.resource_version = Some(version);
        }
    }

    pub fn capp(&self, name: &str) -> Option<Capp> {
        self.state().capps.get(&key(NAMESPACE, name)).cloned()
    }

    pub fn capps(&self) -> Vec<Capp> {
        self.state().capps.values().cloned().collect()
    }

    pub fn service(&self, name: &str) -> Option<KnativeService> {
        self.state().services.get(&key(NAMESPACE, name)).cloned()
    }

    pub fn revision(&self, name: &str) -> Option<Revision> {
        self.state().revisions.get(&key(NAMESPACE, name)).cloned()
    }

    pub fn revision_names(&self, service: &str) -> Vec<String> {
        self.state()
            .sorted_revisions(NAMESPACE, service)
            .iter()
            .map(|r| r.name_any())
            .collect()
    }

    pub fn put_secret(&self, name: &str, data: &[(&str, &str)]) {
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        let mut state = self.state();
        secret.metadata.resource_version = Some(state.next_version());
        state.secrets.insert(key(NAMESPACE, name), secret);
    }

    pub fn put_capp_config(&self, autoscale: AutoscaleConfig) {
        let config = Config::default();
        let mut capp_config = CappConfig::new(
            &config.capp_config_name,
            CappConfigSpec {
                autoscale_config: autoscale,
            },
        );
        capp_config.metadata.namespace = Some(config.capp_config_namespace.clone());
        self.state().configs.insert(
            key(&config.capp_config_namespace, &config.capp_config_name),
            capp_config,
        );
    }

    /// The next `count` Service replaces fail with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.state().pending_conflicts = count;
    }

    pub fn service_writes(&self) -> u64 {
        self.state().service_writes
    }

    pub fn status_writes(&self) -> u64 {
        self.state().status_writes
    }
}

#[async_trait]
impl CappKubeClient for FakeCluster {
    async fn get_capp_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CappConfig>, Error> {
        Ok(self.state().configs.get(&key(namespace, name)).cloned())
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KnativeService>, Error> {
        Ok(self.state().services.get(&key(namespace, name)).cloned())
    }

    async fn create_service(&self, service: &KnativeService) -> Result<KnativeService, Error> {
        let mut state = self.state();
        let k = key(&service.namespace().unwrap_or_default(), &service.name_any());
        if state.services.contains_key(&k) {
            return Err(Error::AlreadyExists(format!("Service {}/{}", k.0, k.1)));
        }

        let mut created = service.clone();
        created
            .annotations_mut()
            .insert("serving.knative.dev/creator".into(), "system:admin".into());
        created.template_mut().spec.timeout_seconds.get_or_insert(300);
        created.metadata.resource_version = Some(state.next_version());
        state.serve(&mut created, None);
        state.service_writes += 1;
        state.services.insert(k, created.clone());
        Ok(created)
    }

    async fn replace_service(&self, service: &KnativeService) -> Result<KnativeService, Error> {
        let mut state = self.state();
        let k = key(&service.namespace().unwrap_or_default(), &service.name_any());
        let Some(previous) = state.services.get(&k).cloned() else {
            return Err(Error::NotFound(format!("Service {}/{}", k.0, k.1)));
        };
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(Error::Conflict("injected conflict".into()));
        }
        if service.metadata.resource_version != previous.metadata.resource_version {
            return Err(Error::Conflict(format!("Service {}/{} was modified", k.0, k.1)));
        }

        let mut replaced = service.clone();
        replaced.template_mut().spec.timeout_seconds.get_or_insert(300);
        replaced.metadata.resource_version = Some(state.next_version());
        state.serve(&mut replaced, Some(&previous));
        state.service_writes += 1;
        state.services.insert(k, replaced.clone());
        Ok(replaced)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state();
        if state.services.remove(&key(namespace, name)).is_some() {
            state.service_writes += 1;
            state.revisions.retain(|(ns, _), r| {
                ns != namespace || r.labels().get(SERVICE_LABEL).map(String::as_str) != Some(name)
            });
        }
        Ok(())
    }

    async fn list_revisions(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<Revision>, Error> {
        Ok(self.state().revisions_of(namespace, service))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.state().secrets.get(&key(namespace, name)).cloned())
    }

    async fn patch_capp_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CappStatus,
    ) -> Result<(), Error> {
        let mut state = self.state();
        let version = state.next_version();
        let capp = state
            .capps
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("Capp {namespace}/{name}")))?;
        capp.status = Some(status.clone());
        capp.metadata.resource_version = Some(version);
        state.status_writes += 1;
        Ok(())
    }

    async fn patch_capp_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let mut state = self.state();
        let k = key(namespace, name);
        let version = state.next_version();
        let capp = state
            .capps
            .get_mut(&k)
            .ok_or_else(|| Error::NotFound(format!("Capp {namespace}/{name}")))?;
        if resource_version.is_some() && resource_version != capp.metadata.resource_version {
            return Err(Error::Conflict(format!("Capp {namespace}/{name} was modified")));
        }

        if finalizers.is_empty() && capp.metadata.deletion_timestamp.is_some() {
            state.capps.remove(&k);
            return Ok(());
        }
        capp.metadata.finalizers = Some(finalizers);
        capp.metadata.resource_version = Some(version);
        Ok(())
    }
}

/// A running controller reconciling every Capp of a [`FakeCluster`].
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub ctx: Arc<Context>,
    driver: JoinHandle<()>,
}

impl Harness {
    pub fn start() -> Self {
        let cluster = FakeCluster::new();
        let ctx = Arc::new(Context::new(cluster.clone(), Config::default()));

        let driver = {
            let (cluster, ctx) = (cluster.clone(), ctx.clone());
            tokio::spawn(async move {
                loop {
                    for capp in cluster.capps() {
                        if let Err(error) = controller::reconcile(Arc::new(capp), ctx.clone()).await
                        {
                            tracing::debug!(%error, "reconcile failed, retrying on next pass");
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        Self {
            cluster,
            ctx,
            driver,
        }
    }

    /// Runs one reconcile of `name` outside the background loop.
    pub async fn reconcile_once(&self, name: &str) -> Result<(), Error> {
        let capp = self
            .cluster
            .capp(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        controller::reconcile(Arc::new(capp), self.ctx.clone()).await?;
        Ok(())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const INTERVAL: Duration = Duration::from_millis(20);

/// Polls `check` every `interval` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Like [`eventually`], but `check` must hold at every poll.
pub async fn consistently<F>(duration: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + duration;
    while tokio::time::Instant::now() < deadline {
        if !check() {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
    check()
}

pub fn test_capp(name: &str) -> Capp {
    let mut capp = Capp::new(name, CappSpec::default());
    capp.metadata.namespace = Some(NAMESPACE.to_string());
    capp.spec.configuration_spec.template.spec.pod_spec.containers = vec![Container {
        name: "autoscale-go".into(),
        image: Some(IMAGE.into()),
        ..Default::default()
    }];
    capp
}

pub fn latest_ready(cluster: &FakeCluster, name: &str) -> Option<String> {
    cluster
        .capp(name)
        .and_then(|c| c.latest_ready_revision_name().map(str::to_string))
}

pub fn latest_created(cluster: &FakeCluster, name: &str) -> Option<String> {
    cluster
        .capp(name)
        .and_then(|c| c.latest_created_revision_name().map(str::to_string))
}

pub fn template_annotation(cluster: &FakeCluster, name: &str, annotation: &str) -> Option<String> {
    cluster
        .service(name)
        .and_then(|s| s.template().annotations()?.get(annotation).cloned())
}
