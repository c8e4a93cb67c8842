//! Per-reconcile working state.
//!
//! A [`Scope`] is built fresh for every reconcile pass of a cluster. It holds
//! the observed state of the cluster's objects, the resolved blueprint, and
//! the trackers which accumulate upgrade and hook decisions as the pass
//! progresses. Nothing in here touches the API server.

use std::collections::{BTreeMap, BTreeSet};

use helmsman_core::crd::{Cluster, ControlPlane, Machine, MachineDeployment, MachinePool};

use crate::blueprint::ClusterBlueprint;
use crate::hooks::HookResponseTracker;

/// The working state of a single reconcile pass.
pub struct Scope {
    /// The cluster being reconciled.
    pub cluster: Cluster,
    /// The resolved blueprint, populated once the ClusterClass has been processed.
    pub blueprint: Option<ClusterBlueprint>,
    /// The observed state of the cluster's objects.
    pub current: ClusterState,
    /// Upgrade decisions accumulated during this pass.
    pub upgrade_tracker: UpgradeTracker,
    /// Lifecycle hook responses observed during this pass.
    pub hook_responses: HookResponseTracker,
}

impl Scope {
    /// Create a new scope for the given cluster.
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            blueprint: None,
            current: ClusterState::default(),
            upgrade_tracker: UpgradeTracker::default(),
            hook_responses: HookResponseTracker::default(),
        }
    }
}

/// The observed state of a cluster's objects.
#[derive(Debug, Default)]
pub struct ClusterState {
    /// The control plane and its machines, if the control plane exists.
    pub control_plane: Option<ControlPlaneState>,
    /// MachineDeployments by topology name.
    pub machine_deployments: BTreeMap<String, MachineDeploymentState>,
    /// MachinePools by topology name.
    pub machine_pools: BTreeMap<String, MachinePoolState>,
}

/// The observed control plane and its machines.
#[derive(Debug)]
pub struct ControlPlaneState {
    /// The control plane object.
    pub object: ControlPlane,
    /// The machines of the control plane, sorted by name.
    pub machines: Vec<Machine>,
}

impl ControlPlaneState {
    /// Check if the control plane has not yet completed initial provisioning.
    pub fn is_provisioning(&self) -> bool {
        let initialized = self.object.status.as_ref().and_then(|status| status.initialized).unwrap_or(false);
        !initialized
    }

    /// Check if any control plane machine has not yet converged on the control plane's version.
    pub fn is_upgrading(&self) -> bool {
        let desired = &self.object.spec.version;
        self.machines
            .iter()
            .any(|machine| machine.spec.version.as_ref().map(|version| version != desired).unwrap_or(false))
    }
}

/// An observed MachineDeployment and its machines.
#[derive(Debug)]
pub struct MachineDeploymentState {
    /// The MachineDeployment object.
    pub object: MachineDeployment,
    /// The machines of this pool, sorted by name.
    pub machines: Vec<Machine>,
}

impl MachineDeploymentState {
    /// Check if any machine of this pool has not yet converged on the pool's version.
    pub fn is_upgrading(&self) -> bool {
        is_pool_upgrading(self.object.spec.version.as_deref(), &self.machines)
    }
}

/// An observed MachinePool and its machines.
#[derive(Debug)]
pub struct MachinePoolState {
    /// The MachinePool object.
    pub object: MachinePool,
    /// The machines of this pool, sorted by name.
    pub machines: Vec<Machine>,
}

impl MachinePoolState {
    /// Check if any machine of this pool has not yet converged on the pool's version.
    pub fn is_upgrading(&self) -> bool {
        is_pool_upgrading(self.object.spec.version.as_deref(), &self.machines)
    }
}

fn is_pool_upgrading(desired: Option<&str>, machines: &[Machine]) -> bool {
    let desired = match desired {
        Some(desired) => desired,
        None => return false,
    };
    machines
        .iter()
        .any(|machine| machine.spec.version.as_deref().map(|version| version != desired).unwrap_or(false))
}

/// Upgrade decisions for the control plane and the worker pools of a cluster.
///
/// A pool may be upgrading (machines still rolling to its current spec
/// version) while its next version is simultaneously pending or deferred;
/// pending and deferred are mutually exclusive.
#[derive(Default)]
pub struct UpgradeTracker {
    /// Control plane upgrade state.
    pub control_plane: ControlPlaneUpgradeTracker,
    /// MachineDeployment upgrade state.
    pub machine_deployments: WorkerUpgradeTracker,
    /// MachinePool upgrade state.
    pub machine_pools: WorkerUpgradeTracker,
}

/// Control plane upgrade state.
#[derive(Default)]
pub struct ControlPlaneUpgradeTracker {
    /// The control plane has not completed initial provisioning.
    pub is_provisioning: bool,
    /// The control plane is rolling machines to its current spec version.
    pub is_upgrading: bool,
    /// A newer version is desired but cannot be propagated yet.
    pub is_pending_upgrade: bool,
}

/// Upgrade state for one family of worker pools.
#[derive(Default)]
pub struct WorkerUpgradeTracker {
    upgrading: BTreeSet<String>,
    pending: BTreeSet<String>,
    deferred: BTreeSet<String>,
}

impl WorkerUpgradeTracker {
    /// Mark the named pool as currently upgrading.
    pub fn mark_upgrading(&mut self, name: &str) {
        self.upgrading.insert(name.to_string());
    }

    /// Mark the named pool's upgrade as pending on an external gate.
    pub fn mark_pending(&mut self, name: &str) {
        self.deferred.remove(name);
        self.pending.insert(name.to_string());
    }

    /// Mark the named pool's upgrade as explicitly deferred.
    pub fn mark_deferred(&mut self, name: &str) {
        self.pending.remove(name);
        self.deferred.insert(name.to_string());
    }

    /// Check if the named pool is marked as currently upgrading.
    pub fn is_upgrading(&self, name: &str) -> bool {
        self.upgrading.contains(name)
    }

    /// Check if any pool is currently upgrading.
    pub fn is_any_upgrading(&self) -> bool {
        !self.upgrading.is_empty()
    }

    /// Check if any pool has a pending upgrade.
    pub fn is_any_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Check if any pool has a deferred upgrade.
    pub fn is_any_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// The names of upgrading pools, sorted.
    pub fn upgrading_names(&self) -> Vec<String> {
        self.upgrading.iter().cloned().collect()
    }

    /// The names of pools with pending upgrades, sorted.
    pub fn pending_names(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// The names of pools with deferred upgrades, sorted.
    pub fn deferred_names(&self) -> Vec<String> {
        self.deferred.iter().cloned().collect()
    }

    /// The number of pools currently upgrading.
    pub fn upgrading_count(&self) -> usize {
        self.upgrading.len()
    }
}
