use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Capp controller: reconciles Capps into Knative Services
#[derive(Parser, Debug, Clone)]
#[command(name = "capp-controller", version, about, long_about = None)]
pub struct Config {
    /// Field manager recorded on every write
    #[arg(long, env = "CAPP_FIELD_MANAGER", default_value = "capp-controller")]
    pub field_manager: String,

    /// Name of the CappConfig holding autoscaling defaults
    #[arg(long, env = "CAPP_CONFIG_NAME", default_value = "capp-config")]
    pub capp_config_name: String,

    /// Namespace of the CappConfig
    #[arg(long, env = "CAPP_CONFIG_NAMESPACE", default_value = "capp-operator-system")]
    pub capp_config_namespace: String,

    /// Maximum number of Capps reconciled concurrently
    #[arg(long, env = "CAPP_WORKERS", default_value_t = 4)]
    pub workers: u16,

    /// Deadline for a single reconcile
    #[arg(long, default_value_t = 30)]
    pub reconcile_timeout_secs: u64,

    /// Resync interval for Capps in a steady state
    #[arg(long, default_value_t = 300)]
    pub requeue_secs: u64,

    /// Requeue interval while a rollout is still in progress
    #[arg(long, default_value_t = 5)]
    pub pending_requeue_secs: u64,

    /// First delay of the error requeue backoff
    #[arg(long, default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Upper bound of the error requeue backoff
    #[arg(long, default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Maximum attempts of an optimistic read-modify-write
    #[arg(long, default_value_t = 5)]
    pub conflict_retries: u32,

    #[arg(long, value_enum, env = "CAPP_LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn requeue(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    pub fn pending_requeue(&self) -> Duration {
        Duration::from_secs(self.pending_requeue_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            field_manager: "capp-controller".to_string(),
            capp_config_name: "capp-config".to_string(),
            capp_config_namespace: "capp-operator-system".to_string(),
            workers: 4,
            reconcile_timeout_secs: 30,
            requeue_secs: 300,
            pending_requeue_secs: 5,
            backoff_base_ms: 500,
            backoff_max_secs: 300,
            conflict_retries: 5,
            log_format: LogFormat::Text,
        }
    }
}
