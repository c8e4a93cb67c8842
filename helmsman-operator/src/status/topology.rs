//! TopologyReconciled condition synthesis.
//!
//! Written at the end of every reconcile pass from the trackers accumulated in
//! the scope. The legacy mirror is maintained alongside the current condition.

use chrono::{DateTime, Utc};
use kube::Resource;

use helmsman_core::conditions::{self, Condition, ConditionStatus, LegacyCondition, LegacySeverity};
use helmsman_core::crd::CONDITION_TOPOLOGY_RECONCILED;

use super::name_list;
use crate::hooks::HOOK_BEFORE_CLUSTER_UPGRADE;
use crate::scope::Scope;

pub const REASON_RECONCILE_SUCCEEDED: &str = "TopologyReconcileSucceeded";
pub const REASON_RECONCILE_FAILED: &str = "TopologyReconcileFailed";
pub const REASON_DELETING: &str = "Deleting";
pub const REASON_HOOK_BLOCKING: &str = "HookBlocking";
pub const REASON_CONTROL_PLANE_UPGRADE_PENDING: &str = "ControlPlaneUpgradePending";
pub const REASON_MACHINE_DEPLOYMENTS_UPGRADE_PENDING: &str = "MachineDeploymentsUpgradePending";
pub const REASON_MACHINE_POOLS_UPGRADE_PENDING: &str = "MachinePoolsUpgradePending";
pub const REASON_MACHINE_DEPLOYMENTS_UPGRADE_DEFERRED: &str = "MachineDeploymentsUpgradeDeferred";
pub const REASON_MACHINE_POOLS_UPGRADE_DEFERRED: &str = "MachinePoolsUpgradeDeferred";

/// Set the TopologyReconciled condition on the cluster in the scope.
///
/// `reconcile_error` carries the error which aborted the pass, if any.
/// Exactly one of the hold/deferred causes is reported, in a fixed order of
/// precedence: deletion, reconcile error, blocking hook, control plane hold,
/// MachineDeployment hold, MachinePool hold, deferred upgrades.
pub fn set_topology_reconciled_condition(scope: &mut Scope, reconcile_error: Option<&str>, now: DateTime<Utc>) {
    let (condition, legacy) = compute(scope, reconcile_error);
    let status = scope.cluster.status.get_or_insert_with(Default::default);
    conditions::set(&mut status.conditions, condition, now);
    let deprecated = status.deprecated.get_or_insert_with(Default::default);
    conditions::set_legacy(&mut deprecated.conditions, legacy, now);
}

fn compute(scope: &Scope, reconcile_error: Option<&str>) -> (Condition, LegacyCondition) {
    if scope.cluster.meta().deletion_timestamp.is_some() {
        return falsy(REASON_DELETING, "Cluster is deleting", LegacySeverity::Info);
    }

    if let Some(error) = reconcile_error {
        return falsy(REASON_RECONCILE_FAILED, error, LegacySeverity::Error);
    }

    if let Some(message) = scope.hook_responses.blocking_message(HOOK_BEFORE_CLUSTER_UPGRADE) {
        let message = format!("hook {:?} is blocking: {}", HOOK_BEFORE_CLUSTER_UPGRADE, message);
        return falsy(REASON_HOOK_BLOCKING, message, LegacySeverity::Info);
    }

    let target_version = scope
        .cluster
        .spec
        .topology
        .as_ref()
        .map(|topology| topology.version.as_str())
        .unwrap_or_default();
    let tracker = &scope.upgrade_tracker;

    if tracker.control_plane.is_pending_upgrade {
        let message = format!(
            "Control plane rollout and upgrade to version {} on hold. {}",
            target_version,
            hold_detail(scope)
        );
        return falsy(REASON_CONTROL_PLANE_UPGRADE_PENDING, message, LegacySeverity::Info);
    }

    if tracker.machine_deployments.is_any_pending() {
        let message = format!(
            "MachineDeployment(s) {} rollout and upgrade to version {} on hold. {}",
            name_list(&tracker.machine_deployments.pending_names()),
            target_version,
            hold_detail(scope)
        );
        return falsy(REASON_MACHINE_DEPLOYMENTS_UPGRADE_PENDING, message, LegacySeverity::Info);
    }

    if tracker.machine_pools.is_any_pending() {
        let message = format!(
            "MachinePool(s) {} rollout and upgrade to version {} on hold. {}",
            name_list(&tracker.machine_pools.pending_names()),
            target_version,
            hold_detail(scope)
        );
        return falsy(REASON_MACHINE_POOLS_UPGRADE_PENDING, message, LegacySeverity::Info);
    }

    if tracker.machine_deployments.is_any_deferred() {
        let message = format!(
            "MachineDeployment(s) {} rollout and upgrade to version {} deferred.",
            name_list(&tracker.machine_deployments.deferred_names()),
            target_version
        );
        return falsy(REASON_MACHINE_DEPLOYMENTS_UPGRADE_DEFERRED, message, LegacySeverity::Info);
    }

    if tracker.machine_pools.is_any_deferred() {
        let message = format!(
            "MachinePool(s) {} rollout and upgrade to version {} deferred.",
            name_list(&tracker.machine_pools.deferred_names()),
            target_version
        );
        return falsy(REASON_MACHINE_POOLS_UPGRADE_DEFERRED, message, LegacySeverity::Info);
    }

    let condition = Condition::new(CONDITION_TOPOLOGY_RECONCILED, ConditionStatus::True, REASON_RECONCILE_SUCCEEDED, "");
    let legacy = LegacyCondition::truthy(CONDITION_TOPOLOGY_RECONCILED);
    (condition, legacy)
}

/// Describe what an upgrade is currently waiting on.
fn hold_detail(scope: &Scope) -> String {
    let tracker = &scope.upgrade_tracker;
    if tracker.control_plane.is_provisioning {
        return "Control plane is completing initial provisioning".to_string();
    }
    if tracker.control_plane.is_upgrading {
        let current = scope
            .current
            .control_plane
            .as_ref()
            .map(|state| state.object.spec.version.as_str())
            .unwrap_or_default();
        return format!("Control plane is upgrading to version {}", current);
    }
    if tracker.machine_deployments.is_any_upgrading() {
        return format!(
            "MachineDeployment(s) {} are upgrading",
            name_list(&tracker.machine_deployments.upgrading_names())
        );
    }
    if tracker.machine_pools.is_any_upgrading() {
        return format!("MachinePool(s) {} are upgrading", name_list(&tracker.machine_pools.upgrading_names()));
    }
    String::new()
}

fn falsy(reason: &str, message: impl Into<String>, severity: LegacySeverity) -> (Condition, LegacyCondition) {
    let message = message.into();
    let condition = Condition::new(CONDITION_TOPOLOGY_RECONCILED, ConditionStatus::False, reason, message.clone());
    let legacy = LegacyCondition::falsy(CONDITION_TOPOLOGY_RECONCILED, reason, severity, message);
    (condition, legacy)
}
