//! Typed `serving.knative.dev/v1` resources the controller reads and writes.
//!
//! Only the fields the controller projects or inspects are modelled
//! explicitly; the pod spec is the upstream `PodSpec` flattened into the
//! revision template the same way Knative embeds it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodSpec;
use kube::{CustomResource, ResourceExt, api::ObjectMeta};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label Knative stamps on every Revision with the name of its Service.
pub const SERVICE_LABEL: &str = "serving.knative.dev/service";
/// Label Knative stamps on every Revision with its Configuration generation.
pub const CONFIGURATION_GENERATION_LABEL: &str = "serving.knative.dev/configurationGeneration";
/// Prefix of metadata keys owned by the Knative control plane.
pub const SERVING_KEY_PREFIX: &str = "serving.knative.dev/";

pub const METRIC_ANNOTATION: &str = "autoscaling.knative.dev/metric";
pub const TARGET_ANNOTATION: &str = "autoscaling.knative.dev/target";
pub const ACTIVATION_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/activation-scale";
pub const CLASS_ANNOTATION: &str = "autoscaling.knative.dev/class";
pub const HPA_CLASS: &str = "hpa.autoscaling.knative.dev";

/// `ConfigurationSpec` holds the template stamped out into Revisions.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ConfigurationSpec {
    #[serde(default)]
    pub template: RevisionTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RevisionTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    #[serde(default)]
    pub spec: RevisionSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSpec {
    #[serde(flatten)]
    pub pod_spec: PodSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_concurrency: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

impl RevisionTemplateSpec {
    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.as_ref().and_then(|m| m.labels.as_ref())
    }

    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.as_ref().and_then(|m| m.annotations.as_ref())
    }
}

/// Knative Service: the serving resource generated for each Capp.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Service",
    root = "KnativeService",
    namespaced,
    status = "KnativeServiceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KnativeServiceSpec {
    #[serde(flatten)]
    pub configuration_spec: ConfigurationSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<Vec<TrafficTarget>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<i64>,
}

/// Revision bookkeeping shared by Knative Services and Capps.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationStatusFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_ready_revision_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_created_revision_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnativeServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<KnativeCondition>,

    #[serde(flatten)]
    pub configuration_status_fields: ConfigurationStatusFields,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A Knative status condition. Timestamps are kept verbatim.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnativeCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Tri-state readiness of a Knative object, read off its `Ready` condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
    Unknown,
}

fn readiness_of(conditions: &[KnativeCondition]) -> Readiness {
    match conditions.iter().find(|c| c.type_ == "Ready") {
        Some(c) if c.status == "True" => Readiness::Ready,
        Some(c) if c.status == "False" => Readiness::NotReady,
        _ => Readiness::Unknown,
    }
}

/// Revision: an immutable snapshot of a Service's template.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Revision",
    namespaced,
    status = "RevisionStatus"
)]
pub struct RevisionCrdSpec {
    #[serde(flatten)]
    pub spec: RevisionSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevisionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<KnativeCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
}

impl Revision {
    pub fn readiness(&self) -> Readiness {
        self.status
            .as_ref()
            .map(|s| readiness_of(&s.conditions))
            .unwrap_or(Readiness::Unknown)
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    /// Configuration generation this Revision was stamped from, if labelled.
    pub fn configuration_generation(&self) -> Option<i64> {
        self.labels()
            .get(CONFIGURATION_GENERATION_LABEL)
            .and_then(|g| g.parse().ok())
    }
}

impl KnativeService {
    pub fn template(&self) -> &RevisionTemplateSpec {
        &self.spec.configuration_spec.template
    }

    pub fn template_mut(&mut self) -> &mut RevisionTemplateSpec {
        &mut self.spec.configuration_spec.template
    }

    /// Whether the Knative controller has caught up with the latest spec.
    pub fn is_observed(&self) -> bool {
        let observed = self.status.as_ref().and_then(|s| s.observed_generation);
        match (self.metadata.generation, observed) {
            (Some(generation), Some(observed)) => observed >= generation,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}
