use std::{fmt, str::FromStr};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::knative::{ConfigurationSpec, ConfigurationStatusFields};

/// Label carrying the name of the Capp that owns a Service.
pub const PARENT_CAPP_LABEL: &str = "rcs.dana.io/parent-capp";
/// Label carrying the namespace of the Capp that owns a Service.
pub const PARENT_CAPP_NS_LABEL: &str = "rcs.dana.io/parent-capp-ns";
pub const MANAGED_BY_LABEL: &str = "rcs.dana.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "capp";
/// Template annotation that pins the content of every referenced Secret.
pub const SECRET_DIGEST_ANNOTATION: &str = "rcs.dana.io/secret-digest";
/// Template annotation that pins the projected pod spec, so removing a field
/// from the Capp is seen as drift.
pub const TEMPLATE_DIGEST_ANNOTATION: &str = "rcs.dana.io/template-digest";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Capp",
    group = "rcs.dana.io",
    version = "v1alpha1",
    namespaced,
    shortname = "capp",
    status = "CappStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"LatestReady","type":"string","jsonPath":".status.knativeObjectStatus.latestReadyRevisionName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CappSpec {
    #[serde(default)]
    pub configuration_spec: ConfigurationSpec,

    /// One of `cpu`, `memory`, `rps` or `concurrency`. Left unset, the
    /// platform default metric applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_metric: Option<String>,
}

impl CappSpec {
    /// Parses the configured scale metric. An empty string counts as unset.
    pub fn scale_metric(&self) -> Result<Option<ScaleMetric>, UnsupportedScaleMetric> {
        match self.scale_metric.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleMetric {
    Cpu,
    Memory,
    Rps,
    Concurrency,
}

impl ScaleMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleMetric::Cpu => "cpu",
            ScaleMetric::Memory => "memory",
            ScaleMetric::Rps => "rps",
            ScaleMetric::Concurrency => "concurrency",
        }
    }

    /// Resource metrics are only served by the HPA autoscaler class.
    pub fn requires_hpa(&self) -> bool {
        matches!(self, ScaleMetric::Cpu | ScaleMetric::Memory)
    }
}

impl fmt::Display for ScaleMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported scale metric {0:?}, expected one of cpu, memory, rps, concurrency")]
pub struct UnsupportedScaleMetric(pub String);

impl FromStr for ScaleMetric {
    type Err = UnsupportedScaleMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(ScaleMetric::Cpu),
            "memory" => Ok(ScaleMetric::Memory),
            "rps" => Ok(ScaleMetric::Rps),
            "concurrency" => Ok(ScaleMetric::Concurrency),
            other => Err(UnsupportedScaleMetric(other.to_string())),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CappState {
    Creating,
    Reconciling,
    Ready,
    Degraded,
    Deleting,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnativeObjectStatus {
    #[serde(flatten)]
    pub configuration_status_fields: ConfigurationStatusFields,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CappStatus {
    #[serde(default)]
    pub knative_object_status: KnativeObjectStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CappState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl CappStatus {
    pub fn revisions(&self) -> &ConfigurationStatusFields {
        &self.knative_object_status.configuration_status_fields
    }

    pub fn revisions_mut(&mut self) -> &mut ConfigurationStatusFields {
        &mut self.knative_object_status.configuration_status_fields
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Sets a condition, keeping its transition time unless the status flips.
    /// Re-setting an identical condition leaves the status untouched so a
    /// converged Capp produces no status write.
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: &str,
        reason: &str,
        message: impl Into<String>,
        generation: Option<i64>,
    ) {
        let message = message.into();
        let existing = self.conditions.iter_mut().find(|c| c.type_ == type_);
        match existing {
            Some(c)
                if c.status == status
                    && c.reason == reason
                    && c.message == message
                    && c.observed_generation == generation => {}
            Some(c) => {
                if c.status != status {
                    c.last_transition_time = Time(chrono::Utc::now());
                }
                c.status = status.to_string();
                c.reason = reason.to_string();
                c.message = message;
                c.observed_generation = generation;
            }
            None => self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message,
                observed_generation: generation,
                last_transition_time: Time(chrono::Utc::now()),
            }),
        }
    }
}

impl Capp {
    pub fn latest_ready_revision_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.revisions().latest_ready_revision_name.as_deref())
    }

    pub fn latest_created_revision_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.revisions().latest_created_revision_name.as_deref())
    }
}

/// Defaults applied to every Capp unless overridden on its template.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "CappConfig",
    group = "rcs.dana.io",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CappConfigSpec {
    #[serde(default)]
    pub autoscale_config: AutoscaleConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscaleConfig {
    pub concurrency: i64,
    pub activation_scale: i64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            activation_scale: 3,
        }
    }
}
