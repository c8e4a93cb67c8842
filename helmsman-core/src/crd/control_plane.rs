//! ControlPlane CRD.
//!
//! The control plane object is provisioned by its own provider controller,
//! which reports initialization, etcd membership and certificate state on its
//! status. The topology engine propagates desired version/replicas onto its
//! spec and synthesizes the roll-up conditions below onto its status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, LegacyCondition};
use crate::crd::ObjectRef;

pub type ControlPlane = ControlPlaneCRD; // Mostly to resolve a Rust Analyzer issue.

/// Condition type reporting overall control plane availability.
pub const CONDITION_AVAILABLE: &str = "Available";
/// Condition type reporting whether the control plane has completed initial provisioning.
pub const CONDITION_INITIALIZED: &str = "Initialized";
/// Condition type reporting an in-progress scale up.
pub const CONDITION_SCALING_UP: &str = "ScalingUp";
/// Condition type reporting an in-progress scale down.
pub const CONDITION_SCALING_DOWN: &str = "ScalingDown";
/// Condition type reporting an in-progress rollout of not up-to-date machines.
pub const CONDITION_ROLLING_OUT: &str = "RollingOut";
/// Condition type rolling up the Ready condition of control plane machines.
pub const CONDITION_MACHINES_READY: &str = "MachinesReady";
/// Condition type rolling up the UpToDate condition of control plane machines.
pub const CONDITION_MACHINES_UP_TO_DATE: &str = "MachinesUpToDate";
/// Condition type reporting an in-progress machine remediation.
pub const CONDITION_REMEDIATING: &str = "Remediating";
/// Condition type reporting control plane deletion progress.
pub const CONDITION_DELETING: &str = "Deleting";
/// Condition type reported by the provider when control plane certificates exist.
pub const CONDITION_CERTIFICATES_AVAILABLE: &str = "CertificatesAvailable";

/// CRD spec for the ControlPlane resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "ControlPlaneCRD",
    status = "ControlPlaneStatus",
    group = "helmsman.rs",
    version = "v1beta1",
    kind = "ControlPlane",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "hcp",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas","type":"number","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"number","jsonPath":".status.readyReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// The desired Kubernetes version of the control plane, of the form `vX.Y.Z`.
    pub version: String,
    /// The desired number of control plane machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The template used to provision control plane machines.
    #[serde(default)]
    pub machine_template: MachineTemplate,
    /// Endpoints of an externally managed etcd cluster.
    ///
    /// When set, etcd health is out of scope for this control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_etcd_endpoints: Option<Vec<String>>,
}

impl ControlPlane {
    /// Check if etcd is managed by this control plane, rather than externally.
    pub fn is_etcd_managed(&self) -> bool {
        self.spec.external_etcd_endpoints.is_none()
    }
}

/// The template from which control plane machines are provisioned.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplate {
    /// A reference to the infrastructure machine template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectRef>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    /// Whether the control plane has completed initial provisioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized: Option<bool>,
    /// The version the control plane is currently converged on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// The total number of control plane machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The number of control plane machines with a `Ready` condition of `True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    /// The number of control plane machines with an `Available` condition of `True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
    /// The number of control plane machines with an `UpToDate` condition of `True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to_date_replicas: Option<i32>,

    /// The etcd member list as last observed by the provider controller.
    ///
    /// `None` when the provider has not yet reported membership; distinct from
    /// an empty list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_members: Option<Vec<EtcdMember>>,
    /// Whether the reported etcd member list agrees with the current machines and nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_members_agree_with_machines: Option<bool>,

    /// Details of the most recent machine remediation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_remediation: Option<LastRemediationStatus>,

    /// Current conditions of the control plane.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Deprecated status fields kept for older consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<ControlPlaneDeprecatedStatus>,
}

/// A single member of the etcd cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdMember {
    /// The member name, matching the node name once the member has started.
    ///
    /// Empty for members which have been announced but have not yet joined;
    /// such members are treated as healthy and non-voting. Health of named
    /// members is read from the `EtcdMemberHealthy` condition of the machine
    /// they are bound to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Whether the member is a learner, not yet counted for quorum.
    #[serde(default)]
    pub is_learner: bool,
}

/// Details of the most recent machine remediation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastRemediationStatus {
    /// The name of the machine which was remediated.
    pub machine: String,
    /// When the remediation was initiated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<chrono::DateTime<chrono::Utc>>,
    /// How many times remediation of the same machine has been retried.
    #[serde(default)]
    pub retry_count: i32,
}

/// Deprecated control plane status fields.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneDeprecatedStatus {
    /// The number of ready control plane machines.
    #[serde(default)]
    pub ready_replicas: i32,
    /// The number of not-ready control plane machines.
    #[serde(default)]
    pub unavailable_replicas: i32,
    /// Legacy conditions of the control plane.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<LegacyCondition>,
}
