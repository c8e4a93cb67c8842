//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The Kubernetes namespace in which this operator is running.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// Seconds between full reconciliation passes over all known clusters.
    #[serde(default = "Config::default_full_reconciliation_seconds")]
    pub full_reconciliation_seconds: u64,

    /// Seconds a control plane component may be unhealthy before it is surfaced
    /// on an otherwise available control plane.
    #[serde(default = "Config::default_component_health_debounce_seconds")]
    pub component_health_debounce_seconds: u64,
    /// Seconds after which a deleting machine is reported as stale.
    #[serde(default = "Config::default_stale_deletion_threshold_seconds")]
    pub stale_deletion_threshold_seconds: u64,
    /// Seconds after machine creation during which a missing UpToDate condition
    /// is not reported.
    #[serde(default = "Config::default_machine_creation_grace_seconds")]
    pub machine_creation_grace_seconds: u64,
    /// Seconds after control plane initialization during which a missing etcd
    /// member report is tolerated.
    #[serde(default = "Config::default_etcd_report_grace_seconds")]
    pub etcd_report_grace_seconds: u64,

    /// The maximum number of worker pools allowed to upgrade concurrently.
    #[serde(default = "Config::default_max_concurrent_pool_upgrades")]
    pub max_concurrent_pool_upgrades: usize,
    /// Whether lifecycle hook calls to the runtime extension system are enabled.
    #[serde(default)]
    pub runtime_hooks_enabled: bool,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    fn default_full_reconciliation_seconds() -> u64 {
        300
    }

    fn default_component_health_debounce_seconds() -> u64 {
        10
    }

    fn default_stale_deletion_threshold_seconds() -> u64 {
        900
    }

    fn default_machine_creation_grace_seconds() -> u64 {
        10
    }

    fn default_etcd_report_grace_seconds() -> u64 {
        120
    }

    fn default_max_concurrent_pool_upgrades() -> usize {
        1
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Self {
            rust_log: "".into(),
            namespace: "default".into(),
            pod_name: "helmsman-operator-0".into(),
            full_reconciliation_seconds: Self::default_full_reconciliation_seconds(),
            component_health_debounce_seconds: Self::default_component_health_debounce_seconds(),
            stale_deletion_threshold_seconds: Self::default_stale_deletion_threshold_seconds(),
            machine_creation_grace_seconds: Self::default_machine_creation_grace_seconds(),
            etcd_report_grace_seconds: Self::default_etcd_report_grace_seconds(),
            max_concurrent_pool_upgrades: Self::default_max_concurrent_pool_upgrades(),
            runtime_hooks_enabled: false,
        }
    }
}
