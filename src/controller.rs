use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Resource, ResourceExt,
    api::ListParams,
    client::Client,
    runtime::{
        Controller,
        controller::{Action, Config as ControllerConfig},
        reflector::ObjectRef,
        watcher,
    },
};
use tokio_stream::StreamExt;

use crate::{
    client::{CappKubeClient, CappKubeClientImpl},
    config::Config,
    crd::{AutoscaleConfig, Capp, CappConfig, CappState, CappStatus, PARENT_CAPP_LABEL},
    error::Error,
    knative::{KnativeService, Revision},
    projector,
    retry::{self, RequeueBackoff, RetryConfig},
    revision, secrets,
};

pub const FINALIZER_NAME: &str = "rcs.dana.io/capp-cleanup";
pub const SPEC_VALID_CONDITION: &str = "SpecValid";
pub const READY_CONDITION: &str = "Ready";

pub struct Context {
    pub client: Arc<dyn CappKubeClient>,
    pub config: Config,
    pub backoff: RequeueBackoff,
}

impl Context {
    pub fn new(client: Arc<dyn CappKubeClient>, config: Config) -> Self {
        let backoff = RequeueBackoff::new(config.backoff_base(), config.backoff_max());
        Self {
            client,
            config,
            backoff,
        }
    }

    fn conflict_retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.config.conflict_retries)
    }
}

/// How the Service write step left things.
enum Rollout {
    Created,
    Updated,
    Unchanged,
}

fn object_key(capp: &Capp) -> String {
    format!(
        "{}/{}",
        capp.namespace().unwrap_or_default(),
        capp.name_any()
    )
}

#[tracing::instrument(skip_all)]
pub async fn reconcile(capp: Arc<Capp>, ctx: Arc<Context>) -> Result<Action, Error> {
    let deadline = ctx.config.reconcile_timeout();
    let key = object_key(&capp);

    let result = match tokio::time::timeout(deadline, dispatch(capp, ctx.clone())).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(deadline)),
    };
    if result.is_ok() {
        ctx.backoff.reset(&key);
    }
    result
}

async fn dispatch(capp: Arc<Capp>, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = capp
        .namespace()
        .ok_or_else(|| {
            Error::InvariantViolation(format!("Capp {} has no namespace", capp.name_any()))
        })?;

    info!(
        name = %capp.name_any(),
        namespace = %ns,
        "reconciling Capp resource"
    );

    let has_finalizer = capp.finalizers().iter().any(|f| f == FINALIZER_NAME);
    if capp.meta().deletion_timestamp.is_some() {
        if has_finalizer {
            return capp.cleanup(&ctx).await;
        }
        ctx.backoff.reset(&object_key(&capp));
        return Ok(Action::await_change());
    }

    if !has_finalizer {
        let mut finalizers = capp.finalizers().to_vec();
        finalizers.push(FINALIZER_NAME.to_string());
        ctx.client
            .patch_capp_finalizers(&ns, &capp.name_any(), capp.resource_version(), finalizers)
            .await
            .map_err(|e| Error::FinalizerError(e.to_string()))?;
    }

    capp.apply(&ctx).await
}

impl Capp {
    #[instrument(skip_all)]
    async fn apply(&self, ctx: &Context) -> Result<Action, Error> {
        let client = ctx.client.clone();
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();

        let autoscale = self.autoscale_defaults(ctx).await?;
        let mut desired = match projector::project(self, &autoscale) {
            Ok(desired) => desired,
            Err(Error::ValidationError(message)) => {
                warn!(%message, "Capp spec is invalid, waiting for a spec change");
                self.report_invalid(ctx, &message).await?;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        };
        self.pin_secrets(ctx, &mut desired).await?;

        let (service, rollout) = match client.get_service(&ns, &name).await? {
            None => {
                info!("creating Knative Service");
                (client.create_service(&desired).await?, Rollout::Created)
            }
            Some(observed) if projector::needs_update(&desired, &observed)? => {
                info!("Knative Service differs from Capp, updating");
                (self.update_service(ctx, &desired).await?, Rollout::Updated)
            }
            Some(observed) => (observed, Rollout::Unchanged),
        };

        let revisions = match rollout {
            Rollout::Created => Vec::new(),
            Rollout::Updated | Rollout::Unchanged => client.list_revisions(&ns, &name).await?,
        };
        let state = match rollout {
            Rollout::Created => CappState::Creating,
            Rollout::Updated => CappState::Reconciling,
            Rollout::Unchanged => revision::evaluate_state(&service, &revisions),
        };
        debug!(?state, revisions = revisions.len(), "observed rollout state");

        let mut next = self.clone();
        revision::update_status(&mut next, &service, &revisions);
        let mut status = next.status.unwrap_or_default();
        self.fill_status(&mut status, state, &service);

        if self.status.as_ref() != Some(&status) {
            client.patch_capp_status(&ns, &name, &status).await?;
        }

        Ok(match state {
            CappState::Ready | CappState::Degraded => Action::requeue(ctx.config.requeue()),
            _ => Action::requeue(ctx.config.pending_requeue()),
        })
    }

    #[instrument(skip_all)]
    async fn cleanup(&self, ctx: &Context) -> Result<Action, Error> {
        let client = ctx.client.clone();
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();

        info!("cleaning up Knative Service before removing Capp resource");

        let mut status = self.status.clone().unwrap_or_default();
        if status.state != Some(CappState::Deleting) {
            status.state = Some(CappState::Deleting);
            client.patch_capp_status(&ns, &name, &status).await?;
        }

        client.delete_service(&ns, &name).await?;
        if client.get_service(&ns, &name).await?.is_some() {
            debug!("Knative Service still terminating");
            return Ok(Action::requeue(ctx.config.pending_requeue()));
        }

        // No finalizer can be added once deletion started, so the list is
        // replaced without a version guard.
        let finalizers = self
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER_NAME)
            .cloned()
            .collect();
        match client
            .patch_capp_finalizers(&ns, &name, None, finalizers)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(Error::FinalizerError(e.to_string())),
        }

        ctx.backoff.reset(&object_key(self));
        info!("Knative Service removed, released Capp");
        Ok(Action::await_change())
    }

    async fn autoscale_defaults(&self, ctx: &Context) -> Result<AutoscaleConfig, Error> {
        let config = ctx
            .client
            .get_capp_config(&ctx.config.capp_config_namespace, &ctx.config.capp_config_name)
            .await?;
        Ok(match config {
            Some(config) => config.spec.autoscale_config,
            None => {
                warn!(
                    name = %ctx.config.capp_config_name,
                    namespace = %ctx.config.capp_config_namespace,
                    "CappConfig not found, using built-in autoscale defaults"
                );
                AutoscaleConfig::default()
            }
        })
    }

    /// Resolves every referenced Secret and pins its content on the template.
    async fn pin_secrets(&self, ctx: &Context, service: &mut KnativeService) -> Result<(), Error> {
        let ns = self.namespace().unwrap_or_default();
        let names = secrets::referenced_secrets(&service.template().spec.pod_spec);
        if names.is_empty() {
            return Ok(());
        }

        let mut resolved = BTreeMap::new();
        for name in names {
            let secret = ctx.client.get_secret(&ns, &name).await?;
            if secret.is_none() {
                debug!(secret = %name, "referenced Secret does not exist");
            }
            resolved.insert(name, secret);
        }
        secrets::stamp_digest(service, secrets::secret_digest(&resolved));
        Ok(())
    }

    /// Read-modify-write of the Service, retried on optimistic conflicts.
    async fn update_service(
        &self,
        ctx: &Context,
        desired: &KnativeService,
    ) -> Result<KnativeService, Error> {
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let (client, ns, name) = (&ctx.client, ns.as_str(), name.as_str());

        retry::retry_on_conflict(&ctx.conflict_retry(), "replace_service", move || async move {
            let observed = client
                .get_service(ns, name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Knative Service {ns}/{name}")))?;
            client
                .replace_service(&projector::converge(desired, &observed))
                .await
        })
        .await
    }

    async fn report_invalid(&self, ctx: &Context, message: &str) -> Result<(), Error> {
        let generation = self.metadata.generation;
        let mut status = self.status.clone().unwrap_or_default();
        status.set_condition(SPEC_VALID_CONDITION, "False", "InvalidSpec", message, generation);
        status.set_condition(READY_CONDITION, "False", "InvalidSpec", message, generation);
        status.state = Some(CappState::Degraded);
        status.observed_generation = generation;

        if self.status.as_ref() != Some(&status) {
            ctx.client
                .patch_capp_status(
                    &self.namespace().unwrap_or_default(),
                    &self.name_any(),
                    &status,
                )
                .await?;
        }
        Ok(())
    }

    fn fill_status(&self, status: &mut CappStatus, state: CappState, service: &KnativeService) {
        let generation = self.metadata.generation;
        status.state = Some(state);
        status.observed_generation = generation;
        status.knative_object_status.url = service.status.as_ref().and_then(|s| s.url.clone());
        status.set_condition(SPEC_VALID_CONDITION, "True", "Valid", "", generation);

        let created = status
            .revisions()
            .latest_created_revision_name
            .clone()
            .unwrap_or_default();
        match state {
            CappState::Ready => status.set_condition(
                READY_CONDITION,
                "True",
                "RevisionReady",
                created,
                generation,
            ),
            CappState::Degraded => status.set_condition(
                READY_CONDITION,
                "False",
                "RevisionNotReady",
                format!("revision {created} is not ready"),
                generation,
            ),
            CappState::Creating | CappState::Reconciling | CappState::Deleting => status
                .set_condition(
                    READY_CONDITION,
                    "Unknown",
                    "RolloutInProgress",
                    "",
                    generation,
                ),
        }
    }
}

#[instrument(skip_all)]
pub fn error_policy(capp: Arc<Capp>, error: &Error, ctx: Arc<Context>) -> Action {
    if !error.is_transient() {
        error!(?error, "reconcile failed, waiting for a change before retrying");
        return Action::await_change();
    }

    let delay = ctx.backoff.next_delay(&object_key(&capp));
    warn!(
        ?error,
        delay_ms = delay.as_millis() as u64,
        "error occured on reconcile loop, requeueing"
    );
    Action::requeue(delay)
}

/// Capps in `namespace` whose template reads Secret `name`.
fn capps_reading_secret(
    capps: &[Arc<Capp>],
    namespace: Option<&str>,
    name: &str,
) -> Vec<ObjectRef<Capp>> {
    capps
        .iter()
        .filter(|capp| capp.namespace().as_deref() == namespace)
        .filter(|capp| {
            secrets::referenced_secrets(&capp.spec.configuration_spec.template.spec.pod_spec)
                .contains(name)
        })
        .map(|capp| ObjectRef::from_obj(capp.as_ref()))
        .collect()
}

#[instrument(skip_all)]
pub async fn run(client: Client, config: Config) -> Result<(), Error> {
    let capps = Api::<Capp>::all(client.clone());
    let services = Api::<KnativeService>::all(client.clone());
    let revisions = Api::<Revision>::all(client.clone());
    let secrets = Api::<Secret>::all(client.clone());
    let capp_configs =
        Api::<CappConfig>::namespaced(client.clone(), &config.capp_config_namespace);

    info!("checking if CRDs are installed");
    retry::retry_with_backoff(&RetryConfig::with_max_attempts(5), "list_capps", || {
        let capps = capps.clone();
        async move {
            capps
                .list(&ListParams::default().limit(1))
                .await
                .map_err(Error::from)
        }
    })
    .await?;
    info!("confirmed that CRDs are installed");

    let controller = Controller::new(capps, watcher::Config::default().any_semantic())
        .with_config(ControllerConfig::default().concurrency(config.workers));
    let capp_store = controller.store();
    let config_store = capp_store.clone();
    let config_name = config.capp_config_name.clone();

    let kube_client = CappKubeClientImpl::new(client, config.field_manager.clone());
    let ctx = Context::new(Arc::new(kube_client), config);

    let stream = controller
        .owns(services, watcher::Config::default())
        .watches(
            revisions,
            watcher::Config::default().labels(PARENT_CAPP_LABEL),
            |revision| {
                let namespace = revision.namespace()?;
                let capp = revision.labels().get(PARENT_CAPP_LABEL)?;
                Some(ObjectRef::<Capp>::new(capp).within(&namespace))
            },
        )
        .watches(secrets, watcher::Config::default(), move |secret| {
            capps_reading_secret(
                &capp_store.state(),
                secret.namespace().as_deref(),
                &secret.name_any(),
            )
        })
        .watches(capp_configs, watcher::Config::default(), move |cappconfig| {
            if cappconfig.name_any() != config_name {
                return Vec::new();
            }
            info!("CappConfig changed, reconciling every Capp");
            config_store
                .state()
                .iter()
                .map(|capp| ObjectRef::from_obj(capp.as_ref()))
                .collect()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx));
    let mut stream = std::pin::pin!(stream);

    info!("starting up controller loop process");
    while let Some(res) = stream.next().await {
        if let Err(e) = res {
            error!(error = ?e, "error occured on controller loop");
        }
    }

    info!("controller has been terminated");

    Ok(())
}
