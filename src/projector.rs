//! Projection of a Capp into the Knative Service that serves it.
//!
//! `project` is pure: the same Capp and configuration always yield the same
//! Service, which is what lets the reconciler diff against the live object
//! instead of tracking what it wrote last.

use std::collections::BTreeMap;

use kube::{Resource, ResourceExt, api::ObjectMeta};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    crd::{AutoscaleConfig, Capp, TEMPLATE_DIGEST_ANNOTATION},
    error::Error,
    knative::{
        ACTIVATION_SCALE_ANNOTATION, CLASS_ANNOTATION, ConfigurationSpec, HPA_CLASS,
        KnativeService, KnativeServiceSpec, METRIC_ANNOTATION, RevisionSpec,
        RevisionTemplateSpec, TARGET_ANNOTATION,
    },
    metadata::{self, Metadata, MetadataMerge},
};

/// Computes the desired Knative Service for `capp`.
///
/// Fails with a validation error when the scale metric is unsupported.
pub fn project(capp: &Capp, autoscale: &AutoscaleConfig) -> Result<KnativeService, Error> {
    let name = capp.name_any();
    let namespace = capp
        .namespace()
        .ok_or_else(|| Error::InvariantViolation(format!("Capp {name} has no namespace")))?;
    let metric = capp
        .spec
        .scale_metric()
        .map_err(|e| Error::ValidationError(e.to_string()))?;

    let owned_labels = metadata::controller_owned_labels(&name, &namespace);
    let user_labels = metadata::user_visible(capp.metadata.labels.as_ref());
    let user_annotations = metadata::user_visible(capp.metadata.annotations.as_ref());

    let source = &capp.spec.configuration_spec.template;
    let template_labels = metadata::user_visible(source.labels());
    let template_annotations = metadata::user_visible(source.annotations());

    let defaults = autoscale_defaults(autoscale);
    let mut owned_annotations = Metadata::new();
    owned_annotations.insert(
        TEMPLATE_DIGEST_ANNOTATION.to_string(),
        template_digest(&source.spec)?,
    );
    if let Some(metric) = metric {
        owned_annotations.insert(METRIC_ANNOTATION.to_string(), metric.to_string());
        if metric.requires_hpa() {
            owned_annotations.insert(CLASS_ANNOTATION.to_string(), HPA_CLASS.to_string());
        }
    }

    let template_metadata = ObjectMeta {
        labels: Some(
            MetadataMerge::new()
                .user(user_labels.as_ref())
                .user(template_labels.as_ref())
                .controller_owned(&owned_labels)
                .build(),
        ),
        annotations: Some(
            MetadataMerge::new()
                .defaults(&defaults)
                .user(user_annotations.as_ref())
                .user(template_annotations.as_ref())
                .controller_owned(&owned_annotations)
                .build(),
        ),
        ..Default::default()
    };

    let mut service = KnativeService::new(
        &name,
        KnativeServiceSpec {
            configuration_spec: ConfigurationSpec {
                template: RevisionTemplateSpec {
                    metadata: Some(template_metadata),
                    spec: source.spec.clone(),
                },
            },
            traffic: None,
        },
    );
    service.metadata = ObjectMeta {
        name: Some(name),
        namespace: Some(namespace),
        labels: Some(metadata::merge_metadata(user_labels.as_ref(), &owned_labels)),
        annotations: user_annotations.filter(|a| !a.is_empty()),
        owner_references: capp.controller_owner_ref(&()).map(|oref| vec![oref]),
        ..Default::default()
    };

    Ok(service)
}

/// SHA-256 of the pod spec as the Capp declares it.
///
/// The live pod spec is only checked as a superset of the desired one, which
/// cannot see a field the user removed. The digest can.
fn template_digest(spec: &RevisionSpec) -> Result<String, Error> {
    let bytes = serde_json::to_vec(spec)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn autoscale_defaults(autoscale: &AutoscaleConfig) -> Metadata {
    BTreeMap::from_iter([
        (
            TARGET_ANNOTATION.to_string(),
            autoscale.concurrency.to_string(),
        ),
        (
            ACTIVATION_SCALE_ANNOTATION.to_string(),
            autoscale.activation_scale.to_string(),
        ),
    ])
}

/// Builds the object to submit when moving `observed` towards `desired`.
///
/// Platform-managed keys already on the live object are kept, the traffic
/// block the serving webhook defaulted is left alone, and the observed
/// `resourceVersion` is carried so the write fails on a stale read.
pub fn converge(desired: &KnativeService, observed: &KnativeService) -> KnativeService {
    let mut next = observed.clone();
    next.status = None;

    next.metadata.labels = Some(carry(
        desired.metadata.labels.as_ref(),
        observed.metadata.labels.as_ref(),
    ));
    next.metadata.annotations = Some(carry(
        desired.metadata.annotations.as_ref(),
        observed.metadata.annotations.as_ref(),
    ))
    .filter(|a| !a.is_empty());
    next.metadata.owner_references = desired.metadata.owner_references.clone();

    let mut template = desired.template().clone();
    let observed_template = observed.template();
    let template_metadata = template.metadata.get_or_insert_with(Default::default);
    template_metadata.labels = Some(carry(
        desired.template().labels(),
        observed_template.labels(),
    ));
    template_metadata.annotations = Some(carry(
        desired.template().annotations(),
        observed_template.annotations(),
    ));
    *next.template_mut() = template;

    next
}

fn carry(desired: Option<&Metadata>, observed: Option<&Metadata>) -> Metadata {
    MetadataMerge::new().user(desired).previous(observed).build()
}

/// Whether the live Service has drifted from what the controller wants.
///
/// Metadata is compared exactly (modulo platform-managed keys). The pod spec
/// is compared as a subset so fields the serving webhook defaults do not
/// count as drift; removed fields show up through the template digest
/// annotation.
pub fn needs_update(desired: &KnativeService, observed: &KnativeService) -> Result<bool, Error> {
    let next = converge(desired, observed);

    let metadata_drift = normalized(next.metadata.labels.as_ref())
        != normalized(observed.metadata.labels.as_ref())
        || normalized(next.metadata.annotations.as_ref())
            != normalized(observed.metadata.annotations.as_ref())
        || next.metadata.owner_references != observed.metadata.owner_references
        || normalized(next.template().labels()) != normalized(observed.template().labels())
        || normalized(next.template().annotations())
            != normalized(observed.template().annotations());
    if metadata_drift {
        return Ok(true);
    }

    let wanted = serde_json::to_value(&desired.template().spec)?;
    let live = serde_json::to_value(&observed.template().spec)?;
    Ok(!is_subset(&wanted, &live))
}

fn normalized(metadata: Option<&Metadata>) -> Metadata {
    metadata.cloned().unwrap_or_default()
}

fn is_subset(wanted: &Value, live: &Value) -> bool {
    match (wanted, live) {
        (Value::Null, _) => true,
        (Value::Object(w), Value::Object(l)) => w.iter().all(|(k, v)| match l.get(k) {
            Some(lv) => is_subset(v, lv),
            None => is_empty(v),
        }),
        (Value::Array(w), Value::Array(l)) => {
            w.len() == l.len() && w.iter().zip(l).all(|(a, b)| is_subset(a, b))
        }
        (w, l) => w == l,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
