pub mod conditions;
pub mod crd;
pub mod error;
pub mod prom;

pub use error::{ApiError, BlueprintError};

/// The canonical label identifying the cluster to which an object belongs.
pub const LABEL_CLUSTER: &str = "helmsman.rs/cluster";
/// Label present on machines which are part of the control plane.
pub const LABEL_CONTROL_PLANE: &str = "helmsman.rs/control-plane";
/// Label identifying the MachineDeployment which owns a machine.
pub const LABEL_DEPLOYMENT_NAME: &str = "helmsman.rs/deployment-name";
/// Label identifying the MachinePool which owns a machine.
pub const LABEL_POOL_NAME: &str = "helmsman.rs/pool-name";

/// Annotation which defers the version upgrade of a worker pool topology entry.
pub const ANNOTATION_DEFER_UPGRADE: &str = "helmsman.rs/defer-upgrade";
/// Annotation prefix used to block the BeforeClusterUpgrade lifecycle hook.
pub const ANNOTATION_HOOK_BEFORE_UPGRADE_PREFIX: &str = "hooks.helmsman.rs/before-cluster-upgrade-";
/// Annotation on a control plane recording an in-progress remediation payload.
pub const ANNOTATION_REMEDIATION_IN_PROGRESS: &str = "controlplane.helmsman.rs/remediation-in-progress";
/// Annotation on a machine recording the remediation which created it.
pub const ANNOTATION_REMEDIATION_FOR: &str = "controlplane.helmsman.rs/remediation-for";
