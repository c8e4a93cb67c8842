//! Cluster CRD.
//!
//! The Cluster is the root object of a managed topology. Its `spec.topology`
//! stanza declares the desired shape of the cluster in terms of a ClusterClass,
//! a Kubernetes version, and a set of worker pools.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, LegacyCondition};
use crate::crd::ObjectRef;

pub type Cluster = ClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// Condition type recording the outcome of topology reconciliation.
pub const CONDITION_TOPOLOGY_RECONCILED: &str = "TopologyReconciled";

/// CRD spec for the Cluster resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "ClusterCRD",
    status = "ClusterStatus",
    group = "helmsman.rs",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "hcl",
    printcolumn = r#"{"name":"ClusterClass","type":"string","jsonPath":".spec.topology.class"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.topology.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// A reference to the control plane object of this cluster.
    ///
    /// When unset, the control plane is expected at `<cluster-name>-control-plane`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ObjectRef>,
    /// The desired topology of the cluster.
    ///
    /// Clusters without a topology are not managed by the topology engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<ClusterTopology>,
}

/// The desired topology of a cluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    /// The name of the ClusterClass this topology is stamped from.
    pub class: String,
    /// The desired Kubernetes version of the cluster, of the form `vX.Y.Z`.
    pub version: String,
    /// Control plane topology.
    #[serde(default)]
    pub control_plane: ControlPlaneTopology,
    /// Worker pool topologies.
    #[serde(default)]
    pub workers: WorkersTopology,
    /// Values for the variables defined by the ClusterClass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<ClusterVariable>,
}

/// Control plane specific topology settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneTopology {
    /// The desired number of control plane replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// The worker pools of a topology.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkersTopology {
    /// MachineDeployment topologies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_deployments: Vec<MachineDeploymentTopology>,
    /// MachinePool topologies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_pools: Vec<MachinePoolTopology>,
}

/// A single MachineDeployment entry of a topology.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentTopology {
    /// The worker class of the ClusterClass to stamp this pool from.
    pub class: String,
    /// The unique name of this pool within the cluster.
    pub name: String,
    /// The desired number of replicas in this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The failure domain to place this pool's machines in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
    /// Annotations applied to this pool's topology entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A single MachinePool entry of a topology.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolTopology {
    /// The worker class of the ClusterClass to stamp this pool from.
    pub class: String,
    /// The unique name of this pool within the cluster.
    pub name: String,
    /// The desired number of replicas in this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The failure domain to place this pool's machines in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
    /// Annotations applied to this pool's topology entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// The value of a topology variable.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVariable {
    /// The name of the variable as defined by the ClusterClass.
    pub name: String,
    /// The JSON value of the variable.
    pub value: serde_json::Value,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current conditions of the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Deprecated status fields kept for older consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<ClusterDeprecatedStatus>,
}

/// Deprecated cluster status fields.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeprecatedStatus {
    /// Legacy conditions of the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<LegacyCondition>,
}
