//! MachineDeployment & MachinePool CRDs.
//!
//! Worker pools are reconciled by their own controllers. The topology engine
//! creates them from blueprint entries and propagates desired version and
//! replica counts onto their specs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

pub type MachineDeployment = MachineDeploymentCRD; // Mostly to resolve a Rust Analyzer issue.
pub type MachinePool = MachinePoolCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the MachineDeployment resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "MachineDeploymentCRD",
    status = "MachineDeploymentStatus",
    group = "helmsman.rs",
    version = "v1beta1",
    kind = "MachineDeployment",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "hmd",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas","type":"number","jsonPath":".spec.replicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    /// The desired number of machines in this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The desired Kubernetes version of machines in this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// The failure domain to place machines in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentStatus {
    /// The total number of machines in this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The number of machines with a `Ready` condition of `True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    /// The number of machines with an `UpToDate` condition of `True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to_date_replicas: Option<i32>,
    /// Current conditions of the pool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// CRD spec for the MachinePool resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "MachinePoolCRD",
    status = "MachinePoolStatus",
    group = "helmsman.rs",
    version = "v1beta1",
    kind = "MachinePool",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "hmp",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas","type":"number","jsonPath":".spec.replicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolSpec {
    /// The desired number of machines in this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The desired Kubernetes version of machines in this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// The failure domain to place machines in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolStatus {
    /// The total number of machines in this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The number of machines with a `Ready` condition of `True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    /// The number of machines with an `UpToDate` condition of `True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to_date_replicas: Option<i32>,
    /// Current conditions of the pool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
