//! ClusterClass CRD.
//!
//! A ClusterClass is a reusable template from which Cluster topologies are
//! stamped. Its own controller reconciles referenced templates and reports
//! `status.observedGeneration`; the topology engine refuses to act on a class
//! whose observed generation lags its metadata generation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::ObjectRef;

pub type ClusterClass = ClusterClassCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the ClusterClass resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "ClusterClassCRD",
    status = "ClusterClassStatus",
    group = "helmsman.rs",
    version = "v1beta1",
    kind = "ClusterClass",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "hcc"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterClassSpec {
    /// Control plane template settings.
    #[serde(default)]
    pub control_plane: ControlPlaneClass,
    /// Worker classes which topologies may reference.
    #[serde(default)]
    pub workers: WorkerClasses,
    /// The variables which topologies stamped from this class may set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<ClusterClassVariable>,
}

/// Control plane template settings of a ClusterClass.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneClass {
    /// A reference to the infrastructure machine template backing control plane machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_infrastructure: Option<ObjectRef>,
}

/// The worker classes of a ClusterClass.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerClasses {
    /// Classes available to MachineDeployment topologies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_deployments: Vec<MachineDeploymentClass>,
    /// Classes available to MachinePool topologies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_pools: Vec<MachinePoolClass>,
}

/// A MachineDeployment worker class.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentClass {
    /// The name of this class, referenced by topology entries.
    pub class: String,
    /// The default failure domain for pools of this class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

/// A MachinePool worker class.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolClass {
    /// The name of this class, referenced by topology entries.
    pub class: String,
    /// The default failure domain for pools of this class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

/// The schema of a single topology variable.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterClassVariable {
    /// The name of the variable.
    pub name: String,
    /// Whether topologies must provide a value for this variable.
    #[serde(default)]
    pub required: bool,
    /// The schema constraining values of this variable.
    pub schema: VariableSchema,
}

/// A minimal JSON schema for a topology variable.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VariableSchema {
    /// The JSON type of the variable: string, integer, number, boolean, object or array.
    #[serde(rename = "type")]
    pub type_: String,
    /// The default value applied when a topology omits the variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterClassStatus {
    /// The generation most recently reconciled by the ClusterClass controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
