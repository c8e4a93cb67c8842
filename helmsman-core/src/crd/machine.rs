//! Machine CRD.
//!
//! Machines are provisioned and health-checked by other controllers. The
//! topology engine only reads them: their conditions feed the control plane
//! roll-up conditions and replica counters.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

pub type Machine = MachineCRD; // Mostly to resolve a Rust Analyzer issue.

/// Machine condition type reporting overall readiness.
pub const MACHINE_CONDITION_READY: &str = "Ready";
/// Machine condition type reporting availability (ready and past minimum uptime).
pub const MACHINE_CONDITION_AVAILABLE: &str = "Available";
/// Machine condition type reporting whether the machine matches its owner's desired spec.
pub const MACHINE_CONDITION_UP_TO_DATE: &str = "UpToDate";
/// Machine condition type reported by the machine health checker.
pub const MACHINE_CONDITION_HEALTH_CHECK_SUCCEEDED: &str = "HealthCheckSucceeded";
/// Machine condition type set when the machine's owner has accepted it for remediation.
pub const MACHINE_CONDITION_OWNER_REMEDIATED: &str = "OwnerRemediated";
/// Machine condition type reporting deletion progress, including drain diagnostics.
pub const MACHINE_CONDITION_DELETING: &str = "Deleting";
/// Machine condition type reporting the health of the etcd member hosted on this machine.
pub const MACHINE_CONDITION_ETCD_MEMBER_HEALTHY: &str = "EtcdMemberHealthy";
/// Machine condition types reporting per-machine control plane component health.
pub const MACHINE_COMPONENT_CONDITIONS: &[&str] = &[
    "APIServerPodHealthy",
    "ControllerManagerPodHealthy",
    "SchedulerPodHealthy",
    "EtcdPodHealthy",
];

/// CRD spec for the Machine resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "MachineCRD",
    status = "MachineStatus",
    group = "helmsman.rs",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "hma",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerId"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// The Kubernetes version this machine runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// The provider's identifier for the backing infrastructure.
    ///
    /// Unset while the machine is still provisioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// A reference to the node backing this machine, once registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeRef>,
    /// Current conditions of the machine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// A reference to a node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    /// The name of the node.
    pub name: String,
}
