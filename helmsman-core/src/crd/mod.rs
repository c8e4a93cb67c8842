//! Helmsman CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod cluster;
mod cluster_class;
mod control_plane;
mod machine;
mod workers;

use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use cluster::{
    Cluster, ClusterDeprecatedStatus, ClusterSpec, ClusterStatus, ClusterTopology, ClusterVariable,
    ControlPlaneTopology, MachineDeploymentTopology, MachinePoolTopology, WorkersTopology, CONDITION_TOPOLOGY_RECONCILED,
};
pub use cluster_class::{
    ClusterClass, ClusterClassSpec, ClusterClassStatus, ClusterClassVariable, ControlPlaneClass, MachineDeploymentClass,
    MachinePoolClass, VariableSchema, WorkerClasses,
};
pub use control_plane::{
    ControlPlane, ControlPlaneDeprecatedStatus, ControlPlaneSpec, ControlPlaneStatus, EtcdMember, LastRemediationStatus,
    MachineTemplate, CONDITION_AVAILABLE, CONDITION_CERTIFICATES_AVAILABLE, CONDITION_DELETING, CONDITION_INITIALIZED,
    CONDITION_MACHINES_READY, CONDITION_MACHINES_UP_TO_DATE, CONDITION_REMEDIATING, CONDITION_ROLLING_OUT,
    CONDITION_SCALING_DOWN, CONDITION_SCALING_UP,
};
pub use machine::{
    Machine, MachineSpec, MachineStatus, NodeRef, MACHINE_CONDITION_AVAILABLE, MACHINE_CONDITION_DELETING,
    MACHINE_CONDITION_ETCD_MEMBER_HEALTHY, MACHINE_CONDITION_HEALTH_CHECK_SUCCEEDED, MACHINE_CONDITION_OWNER_REMEDIATED,
    MACHINE_CONDITION_READY, MACHINE_CONDITION_UP_TO_DATE, MACHINE_COMPONENT_CONDITIONS,
};
pub use workers::{MachineDeployment, MachineDeploymentSpec, MachineDeploymentStatus, MachinePool, MachinePoolSpec, MachinePoolStatus};

/// A reference to another object, scoped to the same namespace.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// The API group of the referenced object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// The kind of the referenced object.
    pub kind: String,
    /// The name of the referenced object.
    pub name: String,
}

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

macro_rules! impl_required_metadata {
    ($($crd:ty),*) => {
        $(
            impl RequiredMetadata for $crd {
                fn namespace(&self) -> &str {
                    self.meta().namespace.as_deref().unwrap_or_default()
                }

                fn name(&self) -> &str {
                    self.meta().name.as_deref().unwrap_or_default()
                }
            }
        )*
    };
}

impl_required_metadata!(Cluster, ClusterClass, ControlPlane, Machine, MachineDeployment, MachinePool);
