//! Control plane status synthesis.
//!
//! The control plane provider reports raw observations (initialization,
//! certificates, etcd membership, per-machine component health); this module
//! rolls them up into the replica counters and conditions consumers watch.
//! All routines take `now` explicitly so transition-time handling is
//! deterministic under test.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use helmsman_core::conditions::{self, Condition, ConditionStatus, LegacyCondition, LegacySeverity};
use helmsman_core::crd::{
    ControlPlane, Machine, RequiredMetadata, CONDITION_AVAILABLE, CONDITION_CERTIFICATES_AVAILABLE, CONDITION_DELETING,
    CONDITION_INITIALIZED, CONDITION_MACHINES_READY, CONDITION_MACHINES_UP_TO_DATE, CONDITION_REMEDIATING,
    CONDITION_ROLLING_OUT, CONDITION_SCALING_DOWN, CONDITION_SCALING_UP, MACHINE_COMPONENT_CONDITIONS,
    MACHINE_CONDITION_AVAILABLE, MACHINE_CONDITION_DELETING, MACHINE_CONDITION_ETCD_MEMBER_HEALTHY,
    MACHINE_CONDITION_HEALTH_CHECK_SUCCEEDED, MACHINE_CONDITION_OWNER_REMEDIATED, MACHINE_CONDITION_READY,
    MACHINE_CONDITION_UP_TO_DATE,
};

use super::{aggregate_machine_issues, machine_noun, name_list, MachineIssue, StatusPolicy};

pub const REASON_AVAILABLE: &str = "Available";
pub const REASON_NOT_AVAILABLE: &str = "NotAvailable";
pub const REASON_INSPECTION_FAILED: &str = "InspectionFailed";
pub const REASON_INITIALIZED: &str = "Initialized";
pub const REASON_NOT_INITIALIZED: &str = "NotInitialized";
pub const REASON_WAITING_FOR_REPLICAS_SET: &str = "WaitingForReplicasSet";
pub const REASON_SCALING_UP: &str = "ScalingUp";
pub const REASON_NOT_SCALING_UP: &str = "NotScalingUp";
pub const REASON_SCALING_DOWN: &str = "ScalingDown";
pub const REASON_NOT_SCALING_DOWN: &str = "NotScalingDown";
pub const REASON_ROLLING_OUT: &str = "RollingOut";
pub const REASON_NOT_ROLLING_OUT: &str = "NotRollingOut";
pub const REASON_NO_REPLICAS: &str = "NoReplicas";
pub const REASON_MACHINES_READY: &str = "Ready";
pub const REASON_MACHINES_NOT_READY: &str = "NotReady";
pub const REASON_MACHINES_READY_UNKNOWN: &str = "ReadyUnknown";
pub const REASON_MACHINES_UP_TO_DATE: &str = "UpToDate";
pub const REASON_MACHINES_NOT_UP_TO_DATE: &str = "NotUpToDate";
pub const REASON_MACHINES_UP_TO_DATE_UNKNOWN: &str = "UpToDateUnknown";
pub const REASON_REMEDIATING: &str = "Remediating";
pub const REASON_NOT_REMEDIATING: &str = "NotRemediating";
pub const REASON_DELETING: &str = "Deleting";
pub const REASON_NOT_DELETING: &str = "NotDeleting";

/// Markers recognized in a machine's Deleting condition message, mapped to a
/// drain delay diagnosis. Order is the order diagnoses are reported in.
const DRAIN_HINTS: &[(&str, &str)] = &[
    ("cannot evict pod as it would violate the pod's disruption budget", "PodDisruptionBudgets"),
    ("deletionTimestamp set, but still not removed", "Pods not terminating"),
    ("failed to evict Pod", "Pod eviction errors"),
    ("waiting for completion", "Pods not completed yet"),
];

/// Outcomes of the preflight checks run before propagating spec changes to the
/// control plane, surfaced as blockers on the scaling conditions.
#[derive(Clone, Debug, Default)]
pub struct PreflightCheckResults {
    /// A version upgrade is waiting to be propagated from the cluster topology.
    pub topology_version_pending: Option<String>,
    /// A control plane machine is still being deleted.
    pub has_deleting_machine: bool,
    /// Control plane components are not healthy.
    pub control_plane_components_unhealthy: bool,
    /// The etcd cluster is not healthy.
    pub etcd_cluster_unhealthy: bool,
    /// The kind of the infrastructure machine template, when it does not exist.
    pub infra_template_missing: Option<String>,
}

impl PreflightCheckResults {
    fn blockers(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(version) = &self.topology_version_pending {
            out.push(format!("* waiting for a version upgrade to {} to be propagated from Cluster.spec.topology", version));
        }
        if self.has_deleting_machine {
            out.push("* waiting for a control plane Machine to complete deletion".to_string());
        }
        if self.control_plane_components_unhealthy {
            out.push("* waiting for control plane components to become healthy".to_string());
        }
        if self.etcd_cluster_unhealthy {
            out.push("* waiting for etcd cluster to become healthy".to_string());
        }
        out
    }
}

/// Synthesize the full control plane status from observed machines.
///
/// `deletion` carries the reason/message describing deletion progress, used
/// only while the control plane has a deletion timestamp.
pub fn update(
    cp: &mut ControlPlane, machines: &[Machine], preflight: &PreflightCheckResults, deletion: Option<(&str, &str)>,
    policy: &StatusPolicy, now: DateTime<Utc>,
) {
    set_replicas(cp, machines);
    set_initialized_condition(cp, now);
    set_rolling_out_condition(cp, machines, now);
    set_scaling_up_condition(cp, machines, preflight, now);
    set_scaling_down_condition(cp, machines, preflight, policy, now);
    set_machines_ready_condition(cp, machines, now);
    set_machines_up_to_date_condition(cp, machines, policy, now);
    set_remediating_condition(cp, machines, now);
    let (reason, message) = deletion.unwrap_or((REASON_DELETING, ""));
    set_deleting_condition(cp, reason, message, now);
    set_available_condition(cp, machines, policy, now);
    update_deprecated_status(cp, machines, now);
}

/// Set the replica counters from machine conditions.
///
/// Counters are derived from the observed machines rather than echoed from
/// spec, so they never run ahead of reality.
pub fn set_replicas(cp: &mut ControlPlane, machines: &[Machine]) {
    let converged = !machines.is_empty()
        && machines
            .iter()
            .all(|machine| machine.spec.version.as_deref() == Some(cp.spec.version.as_str()));
    let version = cp.spec.version.clone();
    let status = cp.status.get_or_insert_with(Default::default);
    status.replicas = Some(machines.len() as i32);
    status.ready_replicas = Some(count_true(machines, MACHINE_CONDITION_READY));
    status.available_replicas = Some(count_true(machines, MACHINE_CONDITION_AVAILABLE));
    status.up_to_date_replicas = Some(count_true(machines, MACHINE_CONDITION_UP_TO_DATE));
    if converged {
        status.version = Some(version);
    }
}

pub fn set_initialized_condition(cp: &mut ControlPlane, now: DateTime<Utc>) {
    let initialized = cp.status.as_ref().and_then(|status| status.initialized).unwrap_or(false);
    let condition = if initialized {
        Condition::new(CONDITION_INITIALIZED, ConditionStatus::True, REASON_INITIALIZED, "")
    } else {
        Condition::new(
            CONDITION_INITIALIZED,
            ConditionStatus::False,
            REASON_NOT_INITIALIZED,
            "Waiting for the control plane to be initialized",
        )
    };
    set_condition(cp, condition, now);
}

/// Set the RollingOut condition from the UpToDate condition of each machine.
///
/// Machines whose UpToDate condition is Unknown or missing are not counted as
/// rolling out. The reasons each machine is not up-to-date are merged line by
/// line, version skews first.
pub fn set_rolling_out_condition(cp: &mut ControlPlane, machines: &[Machine], now: DateTime<Utc>) {
    use std::collections::BTreeSet;
    let mut rolling_out = 0;
    let mut version_lines: BTreeSet<String> = BTreeSet::new();
    let mut other_lines: BTreeSet<String> = BTreeSet::new();
    for machine in machines {
        let condition = match machine_condition(machine, MACHINE_CONDITION_UP_TO_DATE) {
            Some(condition) if condition.status == ConditionStatus::False => condition,
            _ => continue,
        };
        rolling_out += 1;
        for line in condition.message.lines().filter(|line| !line.is_empty()) {
            let text = line.trim_start_matches("* ").to_string();
            if text.starts_with("Version") {
                version_lines.insert(text);
            } else {
                other_lines.insert(text);
            }
        }
    }

    let condition = if rolling_out == 0 {
        Condition::new(CONDITION_ROLLING_OUT, ConditionStatus::False, REASON_NOT_ROLLING_OUT, "")
    } else {
        let mut message = format!("Rolling out {} not up-to-date replicas", rolling_out);
        for line in version_lines.iter().chain(other_lines.iter()) {
            message.push_str(&format!("\n* {}", line));
        }
        Condition::new(CONDITION_ROLLING_OUT, ConditionStatus::True, REASON_ROLLING_OUT, message)
    };
    set_condition(cp, condition, now);
}

pub fn set_scaling_up_condition(
    cp: &mut ControlPlane, machines: &[Machine], preflight: &PreflightCheckResults, now: DateTime<Utc>,
) {
    let desired = match cp.spec.replicas {
        Some(replicas) if deletion_time(cp.meta()).is_none() => replicas,
        Some(_) => 0,
        None => {
            let condition = Condition::new(
                CONDITION_SCALING_UP,
                ConditionStatus::Unknown,
                REASON_WAITING_FOR_REPLICAS_SET,
                "Waiting for spec.replicas set",
            );
            set_condition(cp, condition, now);
            return;
        }
    };
    let current = machines.len() as i32;

    let condition = if current >= desired {
        let message = match &preflight.infra_template_missing {
            Some(kind) => format!("Scaling up would be blocked because {} does not exist", kind),
            None => String::new(),
        };
        Condition::new(CONDITION_SCALING_UP, ConditionStatus::False, REASON_NOT_SCALING_UP, message)
    } else {
        let mut message = format!("Scaling up from {} to {} replicas", current, desired);
        let mut blockers = preflight.blockers();
        if let Some(kind) = &preflight.infra_template_missing {
            blockers.push(format!("* {} does not exist", kind));
        }
        if !blockers.is_empty() {
            message.push_str(" is blocked because:\n");
            message.push_str(&blockers.join("\n"));
        }
        Condition::new(CONDITION_SCALING_UP, ConditionStatus::True, REASON_SCALING_UP, message)
    };
    set_condition(cp, condition, now);
}

pub fn set_scaling_down_condition(
    cp: &mut ControlPlane, machines: &[Machine], preflight: &PreflightCheckResults, policy: &StatusPolicy,
    now: DateTime<Utc>,
) {
    let desired = match cp.spec.replicas {
        Some(replicas) if deletion_time(cp.meta()).is_none() => replicas,
        Some(_) => 0,
        None => {
            let condition = Condition::new(
                CONDITION_SCALING_DOWN,
                ConditionStatus::Unknown,
                REASON_WAITING_FOR_REPLICAS_SET,
                "Waiting for spec.replicas set",
            );
            set_condition(cp, condition, now);
            return;
        }
    };
    let current = machines.len() as i32;

    let condition = if current > desired {
        let mut message = format!("Scaling down from {} to {} replicas", current, desired);
        let mut blockers = Vec::new();
        if let Some(stale) = stale_deletion_message(machines, policy, now) {
            blockers.push(stale);
        }
        blockers.extend(preflight.blockers());
        if !blockers.is_empty() {
            message.push_str(" is blocked because:\n");
            message.push_str(&blockers.join("\n"));
        }
        Condition::new(CONDITION_SCALING_DOWN, ConditionStatus::True, REASON_SCALING_DOWN, message)
    } else {
        Condition::new(CONDITION_SCALING_DOWN, ConditionStatus::False, REASON_NOT_SCALING_DOWN, "")
    };
    set_condition(cp, condition, now);
}

/// Describe machines which have been in deletion past the stale threshold.
///
/// When a single machine is stale, its Deleting condition message is scanned
/// for known drain failure markers to diagnose the delay.
fn stale_deletion_message(machines: &[Machine], policy: &StatusPolicy, now: DateTime<Utc>) -> Option<String> {
    let stale: Vec<&Machine> = machines
        .iter()
        .filter(|machine| {
            deletion_time(machine.meta())
                .map(|time| now.signed_duration_since(time) > policy.stale_deletion_threshold)
                .unwrap_or(false)
        })
        .collect();
    if stale.is_empty() {
        return None;
    }
    let threshold = format!("{}m", policy.stale_deletion_threshold.num_minutes());
    if let [machine] = stale.as_slice() {
        let mut message = format!("* Machine {} is in deletion since more than {}", machine.name(), threshold);
        let hints = drain_hints(machine);
        if !hints.is_empty() {
            message.push_str(&format!(", delay likely due to {}", hints.join(", ")));
        }
        return Some(message);
    }
    let mut names: Vec<String> = stale.iter().map(|machine| machine.name().to_string()).collect();
    names.sort_unstable();
    Some(format!("* Machines {} are in deletion since more than {}", name_list(&names), threshold))
}

fn drain_hints(machine: &Machine) -> Vec<&'static str> {
    let message = match machine_condition(machine, MACHINE_CONDITION_DELETING) {
        Some(condition) => condition.message.as_str(),
        None => return Vec::new(),
    };
    DRAIN_HINTS
        .iter()
        .filter(|(marker, _)| message.contains(marker))
        .map(|(_, hint)| *hint)
        .collect()
}

pub fn set_machines_ready_condition(cp: &mut ControlPlane, machines: &[Machine], now: DateTime<Utc>) {
    if machines.is_empty() {
        let condition = Condition::new(CONDITION_MACHINES_READY, ConditionStatus::True, REASON_NO_REPLICAS, "");
        set_condition(cp, condition, now);
        return;
    }

    let mut issues = Vec::new();
    let mut has_false = false;
    for machine in machines {
        match machine_condition(machine, MACHINE_CONDITION_READY) {
            Some(condition) if condition.is_true() => (),
            Some(condition) => {
                if condition.status == ConditionStatus::False {
                    has_false = true;
                }
                issues.push(MachineIssue { machine: machine.name().to_string(), message: issue_message(condition) });
            }
            None => issues.push(MachineIssue {
                machine: machine.name().to_string(),
                message: format!("Condition {} not yet reported", MACHINE_CONDITION_READY),
            }),
        }
    }

    let condition = if issues.is_empty() {
        Condition::new(CONDITION_MACHINES_READY, ConditionStatus::True, REASON_MACHINES_READY, "")
    } else {
        let (status, reason) = if has_false {
            (ConditionStatus::False, REASON_MACHINES_NOT_READY)
        } else {
            (ConditionStatus::Unknown, REASON_MACHINES_READY_UNKNOWN)
        };
        Condition::new(CONDITION_MACHINES_READY, status, reason, aggregate_machine_issues(&issues))
    };
    set_condition(cp, condition, now);
}

/// Set the MachinesUpToDate roll-up.
///
/// A machine created within the creation grace window whose UpToDate condition
/// has not been reported yet is skipped rather than reported, normal
/// propagation delay is not an issue.
pub fn set_machines_up_to_date_condition(
    cp: &mut ControlPlane, machines: &[Machine], policy: &StatusPolicy, now: DateTime<Utc>,
) {
    if machines.is_empty() {
        let condition = Condition::new(CONDITION_MACHINES_UP_TO_DATE, ConditionStatus::True, REASON_NO_REPLICAS, "");
        set_condition(cp, condition, now);
        return;
    }

    let mut issues = Vec::new();
    let mut has_false = false;
    for machine in machines {
        match machine_condition(machine, MACHINE_CONDITION_UP_TO_DATE) {
            Some(condition) if condition.is_true() => (),
            Some(condition) => {
                if condition.status == ConditionStatus::False {
                    has_false = true;
                }
                issues.push(MachineIssue { machine: machine.name().to_string(), message: issue_message(condition) });
            }
            None => {
                let age = creation_time(machine).map(|time| now.signed_duration_since(time));
                if age.map(|age| age < policy.machine_creation_grace).unwrap_or(false) {
                    continue;
                }
                issues.push(MachineIssue {
                    machine: machine.name().to_string(),
                    message: format!("Condition {} not yet reported", MACHINE_CONDITION_UP_TO_DATE),
                });
            }
        }
    }

    let condition = if issues.is_empty() {
        Condition::new(CONDITION_MACHINES_UP_TO_DATE, ConditionStatus::True, REASON_MACHINES_UP_TO_DATE, "")
    } else {
        let (status, reason) = if has_false {
            (ConditionStatus::False, REASON_MACHINES_NOT_UP_TO_DATE)
        } else {
            (ConditionStatus::Unknown, REASON_MACHINES_UP_TO_DATE_UNKNOWN)
        };
        Condition::new(CONDITION_MACHINES_UP_TO_DATE, status, reason, aggregate_machine_issues(&issues))
    };
    set_condition(cp, condition, now);
}

/// Set the Remediating condition.
///
/// A machine is being remediated once its health check failed and its owner
/// has acknowledged it through the OwnerRemediated condition. Unhealthy
/// machines without that acknowledgement are reported, but do not flip the
/// condition to True.
pub fn set_remediating_condition(cp: &mut ControlPlane, machines: &[Machine], now: DateTime<Utc>) {
    let mut remediating = Vec::new();
    let mut unhealthy: Vec<String> = Vec::new();
    for machine in machines {
        let failed_health_check = machine_condition(machine, MACHINE_CONDITION_HEALTH_CHECK_SUCCEEDED)
            .map(|condition| condition.status == ConditionStatus::False)
            .unwrap_or(false);
        if !failed_health_check {
            continue;
        }
        match machine_condition(machine, MACHINE_CONDITION_OWNER_REMEDIATED) {
            Some(condition) => {
                remediating.push(MachineIssue { machine: machine.name().to_string(), message: issue_message(condition) })
            }
            None => unhealthy.push(machine.name().to_string()),
        }
    }

    let condition = if !remediating.is_empty() {
        Condition::new(CONDITION_REMEDIATING, ConditionStatus::True, REASON_REMEDIATING, aggregate_machine_issues(&remediating))
    } else if !unhealthy.is_empty() {
        unhealthy.sort_unstable();
        let verb = if unhealthy.len() == 1 { "is" } else { "are" };
        let message = format!(
            "{} {} {} not healthy (not to be remediated by ControlPlane)",
            machine_noun(unhealthy.len()),
            name_list(&unhealthy),
            verb
        );
        Condition::new(CONDITION_REMEDIATING, ConditionStatus::False, REASON_NOT_REMEDIATING, message)
    } else {
        Condition::new(CONDITION_REMEDIATING, ConditionStatus::False, REASON_NOT_REMEDIATING, "")
    };
    set_condition(cp, condition, now);
}

pub fn set_deleting_condition(cp: &mut ControlPlane, reason: &str, message: &str, now: DateTime<Utc>) {
    let condition = if deletion_time(cp.meta()).is_none() {
        Condition::new(CONDITION_DELETING, ConditionStatus::False, REASON_NOT_DELETING, "")
    } else {
        let reason = if reason.is_empty() { REASON_DELETING } else { reason };
        Condition::new(CONDITION_DELETING, ConditionStatus::True, reason, message)
    };
    set_condition(cp, condition, now);
}

/// Set the Available condition.
///
/// Availability is gated on initialization, certificates, the control plane
/// not being deleted, etcd quorum (for managed etcd) and at least one machine
/// with healthy control plane components. Issues on an otherwise available
/// control plane are surfaced only after holding past the component health
/// debounce, so a single flaky probe never flips the condition message.
pub fn set_available_condition(cp: &mut ControlPlane, machines: &[Machine], policy: &StatusPolicy, now: DateTime<Utc>) {
    let initialized = cp.status.as_ref().and_then(|status| status.initialized).unwrap_or(false);
    if !initialized {
        let condition =
            Condition::new(CONDITION_AVAILABLE, ConditionStatus::False, REASON_NOT_AVAILABLE, "Control plane not yet initialized");
        set_condition(cp, condition, now);
        return;
    }

    let etcd_managed = cp.is_etcd_managed();
    if etcd_managed {
        let members_reported = cp.status.as_ref().map(|status| status.etcd_members.is_some()).unwrap_or(false);
        if !members_reported {
            // The provider gets a grace period after initialization to produce
            // its first membership report.
            let initialized_at = cp
                .status
                .as_ref()
                .and_then(|status| conditions::get(&status.conditions, CONDITION_INITIALIZED))
                .and_then(|condition| condition.last_transition_time);
            let within_grace = initialized_at
                .map(|time| now.signed_duration_since(time) < policy.etcd_report_grace)
                .unwrap_or(true);
            let condition = if within_grace {
                Condition::new(
                    CONDITION_AVAILABLE,
                    ConditionStatus::False,
                    REASON_NOT_AVAILABLE,
                    "Waiting for etcd to report the list of members",
                )
            } else {
                Condition::new(CONDITION_AVAILABLE, ConditionStatus::Unknown, REASON_INSPECTION_FAILED, "Failed to get etcd members")
            };
            set_condition(cp, condition, now);
            return;
        }
        let matching = cp.status.as_ref().and_then(|status| status.etcd_members_agree_with_machines).unwrap_or(false);
        if !matching {
            let condition = Condition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::False,
                REASON_NOT_AVAILABLE,
                "The list of etcd members does not match the list of Machines and Nodes",
            );
            set_condition(cp, condition, now);
            return;
        }
    }

    // Machines without a provider ID have no backing infrastructure yet and do
    // not participate in health counting.
    let eligible: Vec<&Machine> = machines.iter().filter(|machine| machine.spec.provider_id.is_some()).collect();

    let mut component_types: Vec<&str> = MACHINE_COMPONENT_CONDITIONS
        .iter()
        .copied()
        .filter(|type_| etcd_managed || *type_ != "EtcdPodHealthy")
        .collect();
    if etcd_managed {
        component_types.push(MACHINE_CONDITION_ETCD_MEMBER_HEALTHY);
    }

    let mut healthy_machines = 0usize;
    let mut surface_components = false;
    for machine in &eligible {
        let mut healthy = true;
        for type_ in &component_types {
            match machine_condition(machine, type_) {
                Some(condition) if condition.is_true() => (),
                // A condition that flipped within the debounce window is
                // treated as a probe flake: the machine still counts as
                // healthy until the window expires.
                Some(condition) => {
                    if should_surface(condition, policy, now) {
                        healthy = false;
                        surface_components = true;
                    }
                }
                None => {
                    healthy = false;
                    surface_components = true;
                }
            }
        }
        if healthy {
            healthy_machines += 1;
        }
    }

    let mut etcd_line = None;
    let mut quorum_ok = true;
    let mut surface_etcd = false;
    if etcd_managed {
        let members = cp
            .status
            .as_ref()
            .and_then(|status| status.etcd_members.clone())
            .unwrap_or_default();

        // Bind named members to machines through their node, then best-effort
        // to machines still waiting for a node.
        let mut bound: Vec<Option<&Machine>> = members
            .iter()
            .map(|member| {
                if member.name.is_empty() {
                    return None;
                }
                eligible.iter().copied().find(|machine| {
                    machine
                        .status
                        .as_ref()
                        .and_then(|status| status.node_ref.as_ref())
                        .map(|node| node.name == member.name)
                        .unwrap_or(false)
                })
            })
            .collect();
        let mut spare: Vec<&Machine> = eligible
            .iter()
            .copied()
            .filter(|machine| {
                machine.status.as_ref().and_then(|status| status.node_ref.as_ref()).map(|node| node.name.is_empty()).unwrap_or(true)
                    && !bound.iter().flatten().any(|other| other.name() == machine.name())
            })
            .collect();
        for (idx, member) in members.iter().enumerate() {
            if !member.name.is_empty() && bound[idx].is_none() && !spare.is_empty() {
                bound[idx] = Some(spare.remove(0));
            }
        }

        let total = members.len();
        let mut healthy = 0usize;
        let mut voting = 0usize;
        let mut learners = 0usize;
        for (idx, member) in members.iter().enumerate() {
            if member.name.is_empty() {
                // Announced but not yet joined: healthy, non-voting.
                healthy += 1;
                learners += 1;
                continue;
            }
            if member.is_learner {
                learners += 1;
            } else {
                voting += 1;
            }
            match bound[idx] {
                Some(machine) => match machine_condition(machine, MACHINE_CONDITION_ETCD_MEMBER_HEALTHY) {
                    Some(condition) if condition.is_true() => healthy += 1,
                    Some(condition) => {
                        if should_surface(condition, policy, now) {
                            surface_etcd = true;
                        }
                    }
                    None => surface_etcd = true,
                },
                None => surface_etcd = true,
            }
        }

        let quorum = voting / 2 + 1;
        quorum_ok = healthy >= quorum;
        let verb = if healthy == 1 { "is" } else { "are" };
        let learner_note = match learners {
            0 => String::new(),
            1 => ", 1 learner etcd member".to_string(),
            n => format!(", {} learner etcd members", n),
        };
        etcd_line = Some(format!(
            "* {} of {} etcd members {} healthy{}, at least {} healthy member required for etcd quorum",
            healthy, total, verb, learner_note, quorum
        ));
    }

    let certificates_available = cp
        .status
        .as_ref()
        .map(|status| conditions::is_true(&status.conditions, CONDITION_CERTIFICATES_AVAILABLE))
        .unwrap_or(false);

    let mut problems = Vec::new();
    if deletion_time(cp.meta()).is_some() {
        problems.push("* Control plane metadata.deletionTimestamp is set".to_string());
    }
    if !certificates_available {
        problems.push("* Control plane certificates are not available".to_string());
    }
    if etcd_managed && !quorum_ok {
        if let Some(line) = &etcd_line {
            problems.push(line.clone());
        }
    }
    if healthy_machines == 0 {
        problems.push("* There are no Machines with healthy control plane components, at least 1 required".to_string());
    }

    let condition = if !problems.is_empty() {
        Condition::new(CONDITION_AVAILABLE, ConditionStatus::False, REASON_NOT_AVAILABLE, problems.join("\n"))
    } else {
        let mut lines = Vec::new();
        if surface_etcd {
            if let Some(line) = etcd_line {
                lines.push(line);
            }
        }
        if surface_components {
            lines.push(format!(
                "* {} of {} Machines have healthy control plane components, at least 1 required",
                healthy_machines,
                eligible.len()
            ));
        }
        Condition::new(CONDITION_AVAILABLE, ConditionStatus::True, REASON_AVAILABLE, lines.join("\n"))
    };
    set_condition(cp, condition, now);
}

/// Maintain the deprecated status fields from the same observations.
pub fn update_deprecated_status(cp: &mut ControlPlane, machines: &[Machine], now: DateTime<Utc>) {
    let ready = count_true(machines, MACHINE_CONDITION_READY);
    let total = machines.len() as i32;

    let status = cp.status.get_or_insert_with(Default::default);
    let mirrored: Vec<Condition> = [CONDITION_AVAILABLE, CONDITION_MACHINES_READY]
        .iter()
        .filter_map(|type_| conditions::get(&status.conditions, type_).cloned())
        .collect();

    let deprecated = status.deprecated.get_or_insert_with(Default::default);
    deprecated.ready_replicas = ready;
    deprecated.unavailable_replicas = total - ready;
    for condition in mirrored {
        let legacy = if condition.is_true() {
            LegacyCondition::truthy(&condition.type_)
        } else {
            LegacyCondition::falsy(&condition.type_, &condition.reason, LegacySeverity::Warning, condition.message.clone())
        };
        conditions::set_legacy(&mut deprecated.conditions, legacy, now);
    }
}

// //////////////////////////////////////////////////////////////////////////
// Helpers //////////////////////////////////////////////////////////////////

fn set_condition(cp: &mut ControlPlane, condition: Condition, now: DateTime<Utc>) {
    let status = cp.status.get_or_insert_with(Default::default);
    conditions::set(&mut status.conditions, condition, now);
}

fn machine_condition<'a>(machine: &'a Machine, type_: &str) -> Option<&'a Condition> {
    machine.status.as_ref().and_then(|status| conditions::get(&status.conditions, type_))
}

fn count_true(machines: &[Machine], type_: &str) -> i32 {
    machines.iter().filter(|machine| machine_condition(machine, type_).map(Condition::is_true).unwrap_or(false)).count() as i32
}

fn issue_message(condition: &Condition) -> String {
    if condition.message.is_empty() {
        condition.reason.clone()
    } else {
        condition.message.clone()
    }
}

/// Check if a not-True condition has held long enough to be surfaced on an
/// otherwise available control plane.
fn should_surface(condition: &Condition, policy: &StatusPolicy, now: DateTime<Utc>) -> bool {
    match condition.last_transition_time {
        Some(time) => now.signed_duration_since(time) > policy.component_health_debounce,
        None => true,
    }
}

fn creation_time(machine: &Machine) -> Option<DateTime<Utc>> {
    machine.meta().creation_timestamp.as_ref().map(|time| time.0)
}

fn deletion_time(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    meta.deletion_timestamp.as_ref().map(|time| time.0)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{Duration, TimeZone};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use helmsman_core::crd::{ControlPlaneSpec, EtcdMember, MachineSpec, NodeRef};

    fn now() -> DateTime<Utc> {
        Utc.ymd(2024, 6, 1).and_hms(12, 0, 0)
    }

    fn test_cp(replicas: Option<i32>) -> ControlPlane {
        let mut cp = ControlPlane::new(
            "cp1",
            ControlPlaneSpec {
                version: "v1.31.0".into(),
                replicas,
                machine_template: Default::default(),
                external_etcd_endpoints: None,
            },
        );
        cp.metadata = ObjectMeta { name: Some("cp1".into()), namespace: Some("default".into()), ..Default::default() };
        cp
    }

    fn deleted(mut cp: ControlPlane) -> ControlPlane {
        cp.metadata.deletion_timestamp = Some(Time(now()));
        cp
    }

    fn machine(name: &str, conds: Vec<Condition>) -> Machine {
        let mut machine = Machine::new(name, MachineSpec { version: Some("v1.31.0".into()), provider_id: None });
        machine.metadata = ObjectMeta { name: Some(name.into()), namespace: Some("default".into()), ..Default::default() };
        machine.status = Some(helmsman_core::crd::MachineStatus { node_ref: None, conditions: conds });
        machine
    }

    fn provisioned(name: &str, conds: Vec<Condition>) -> Machine {
        let mut m = machine(name, conds);
        m.spec.provider_id = Some(name.into());
        if let Some(status) = m.status.as_mut() {
            status.node_ref = Some(NodeRef { name: name.into() });
        }
        m
    }

    fn cond(type_: &str, status: ConditionStatus, message: &str) -> Condition {
        let mut cond = Condition::new(type_, status, "SomeReason", message);
        cond.last_transition_time = Some(now());
        cond
    }

    fn cond_aged(type_: &str, status: ConditionStatus, secs_ago: i64) -> Condition {
        let mut cond = Condition::new(type_, status, "SomeReason", "");
        cond.last_transition_time = Some(now() - Duration::seconds(secs_ago));
        cond
    }

    fn get_condition(cp: &ControlPlane, type_: &str) -> Condition {
        conditions::get(&cp.status.as_ref().unwrap().conditions, type_).cloned().unwrap()
    }

    fn healthy_components() -> Vec<Condition> {
        let mut conds: Vec<Condition> =
            MACHINE_COMPONENT_CONDITIONS.iter().map(|type_| cond(type_, ConditionStatus::True, "")).collect();
        conds.push(cond(MACHINE_CONDITION_ETCD_MEMBER_HEALTHY, ConditionStatus::True, ""));
        conds
    }

    fn initialized_cp() -> ControlPlane {
        let mut cp = test_cp(Some(3));
        let status = cp.status.get_or_insert_with(Default::default);
        status.initialized = Some(true);
        status.etcd_members_agree_with_machines = Some(true);
        conditions::set(
            &mut status.conditions,
            Condition::new(CONDITION_CERTIFICATES_AVAILABLE, ConditionStatus::True, "Available", ""),
            now(),
        );
        cp
    }

    fn members(names: &[&str]) -> Vec<EtcdMember> {
        names.iter().map(|name| EtcdMember { name: name.to_string(), is_learner: false }).collect()
    }

    // Replica counters

    #[test]
    fn replicas_counted_from_machine_conditions() {
        let mut cp = test_cp(Some(3));
        let machines = vec![
            machine("m1", vec![
                cond(MACHINE_CONDITION_READY, ConditionStatus::True, ""),
                cond(MACHINE_CONDITION_AVAILABLE, ConditionStatus::True, ""),
                cond(MACHINE_CONDITION_UP_TO_DATE, ConditionStatus::True, ""),
            ]),
            machine("m2", vec![
                cond(MACHINE_CONDITION_READY, ConditionStatus::True, ""),
                cond(MACHINE_CONDITION_UP_TO_DATE, ConditionStatus::True, ""),
            ]),
            machine("m3", vec![cond(MACHINE_CONDITION_READY, ConditionStatus::False, "")]),
        ];
        set_replicas(&mut cp, &machines);
        let status = cp.status.unwrap();
        assert_eq!(status.replicas, Some(3));
        assert_eq!(status.ready_replicas, Some(2));
        assert_eq!(status.available_replicas, Some(1));
        assert_eq!(status.up_to_date_replicas, Some(2));
        assert_eq!(status.version, Some("v1.31.0".into()));
    }

    // ScalingUp

    #[test]
    fn scaling_up_unknown_without_replicas() {
        let mut cp = test_cp(None);
        set_scaling_up_condition(&mut cp, &[], &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_SCALING_UP);
        assert_eq!(cond.status, ConditionStatus::Unknown);
        assert_eq!(cond.message, "Waiting for spec.replicas set");
    }

    #[test]
    fn scaling_up_false_when_steady() {
        let mut cp = test_cp(Some(3));
        let machines = vec![machine("m1", vec![]), machine("m2", vec![]), machine("m3", vec![])];
        set_scaling_up_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_SCALING_UP);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, REASON_NOT_SCALING_UP);
        assert!(cond.message.is_empty());
    }

    #[test]
    fn scaling_up_false_notes_missing_template() {
        let mut cp = test_cp(Some(3));
        let machines = vec![machine("m1", vec![]), machine("m2", vec![]), machine("m3", vec![])];
        let preflight = PreflightCheckResults { infra_template_missing: Some("AWSTemplate".into()), ..Default::default() };
        set_scaling_up_condition(&mut cp, &machines, &preflight, now());
        let cond = get_condition(&cp, CONDITION_SCALING_UP);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "Scaling up would be blocked because AWSTemplate does not exist");
    }

    #[test]
    fn scaling_up_reports_delta() {
        let mut cp = test_cp(Some(5));
        let machines = vec![machine("m1", vec![]), machine("m2", vec![]), machine("m3", vec![])];
        set_scaling_up_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_SCALING_UP);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.message, "Scaling up from 3 to 5 replicas");
    }

    #[test]
    fn scaling_up_false_when_deleted() {
        let mut cp = deleted(test_cp(Some(5)));
        let machines = vec![machine("m1", vec![])];
        set_scaling_up_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_SCALING_UP);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, REASON_NOT_SCALING_UP);
    }

    #[test]
    fn scaling_up_blocked_by_missing_template() {
        let mut cp = test_cp(Some(5));
        let machines = vec![machine("m1", vec![]), machine("m2", vec![]), machine("m3", vec![])];
        let preflight = PreflightCheckResults { infra_template_missing: Some("AWSTemplate".into()), ..Default::default() };
        set_scaling_up_condition(&mut cp, &machines, &preflight, now());
        let cond = get_condition(&cp, CONDITION_SCALING_UP);
        assert_eq!(cond.message, "Scaling up from 3 to 5 replicas is blocked because:\n* AWSTemplate does not exist");
    }

    #[test]
    fn scaling_up_blocked_by_preflight_checks() {
        let mut cp = test_cp(Some(5));
        let machines = vec![machine("m1", vec![]), machine("m2", vec![]), machine("m3", vec![])];
        let preflight = PreflightCheckResults {
            topology_version_pending: Some("v1.32.0".into()),
            has_deleting_machine: true,
            control_plane_components_unhealthy: true,
            etcd_cluster_unhealthy: true,
            infra_template_missing: None,
        };
        set_scaling_up_condition(&mut cp, &machines, &preflight, now());
        let cond = get_condition(&cp, CONDITION_SCALING_UP);
        assert_eq!(
            cond.message,
            "Scaling up from 3 to 5 replicas is blocked because:\n\
             * waiting for a version upgrade to v1.32.0 to be propagated from Cluster.spec.topology\n\
             * waiting for a control plane Machine to complete deletion\n\
             * waiting for control plane components to become healthy\n\
             * waiting for etcd cluster to become healthy"
        );
    }

    // ScalingDown

    #[test]
    fn scaling_down_reports_delta() {
        let mut cp = test_cp(Some(3));
        let machines: Vec<Machine> = (1..=5).map(|idx| machine(&format!("m{}", idx), vec![])).collect();
        set_scaling_down_condition(&mut cp, &machines, &Default::default(), &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_SCALING_DOWN);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.message, "Scaling down from 5 to 3 replicas");
    }

    #[test]
    fn scaling_down_targets_zero_when_deleted() {
        let mut cp = deleted(test_cp(Some(3)));
        let machines: Vec<Machine> = (1..=5).map(|idx| machine(&format!("m{}", idx), vec![])).collect();
        set_scaling_down_condition(&mut cp, &machines, &Default::default(), &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_SCALING_DOWN);
        assert_eq!(cond.message, "Scaling down from 5 to 0 replicas");
    }

    #[test]
    fn scaling_down_diagnoses_single_stale_machine() {
        let mut cp = test_cp(Some(1));
        let mut m1 = machine(
            "m1",
            vec![cond(
                MACHINE_CONDITION_DELETING,
                ConditionStatus::True,
                "Drain not completed yet:\n\
                 * Pods pod-1: cannot evict pod as it would violate the pod's disruption budget\n\
                 * Pods pod-2: deletionTimestamp set, but still not removed\n\
                 * Pods pod-3: failed to evict Pod\n\
                 * Pods pod-4: waiting for completion",
            )],
        );
        m1.metadata.deletion_timestamp = Some(Time(now() - Duration::hours(1)));
        let machines = vec![m1, machine("m2", vec![]), machine("m3", vec![])];
        set_scaling_down_condition(&mut cp, &machines, &Default::default(), &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_SCALING_DOWN);
        assert_eq!(
            cond.message,
            "Scaling down from 3 to 1 replicas is blocked because:\n\
             * Machine m1 is in deletion since more than 15m, delay likely due to \
             PodDisruptionBudgets, Pods not terminating, Pod eviction errors, Pods not completed yet"
        );
    }

    #[test]
    fn scaling_down_reports_multiple_stale_machines_without_diagnosis() {
        let mut cp = test_cp(Some(1));
        let mut m1 = machine("m1", vec![]);
        m1.metadata.deletion_timestamp = Some(Time(now() - Duration::hours(1)));
        let mut m2 = machine("m2", vec![]);
        m2.metadata.deletion_timestamp = Some(Time(now() - Duration::hours(1)));
        let machines = vec![m1, m2, machine("m3", vec![])];
        set_scaling_down_condition(&mut cp, &machines, &Default::default(), &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_SCALING_DOWN);
        assert_eq!(
            cond.message,
            "Scaling down from 3 to 1 replicas is blocked because:\n* Machines m1, m2 are in deletion since more than 15m"
        );
    }

    // RollingOut

    #[test]
    fn rolling_out_false_when_all_up_to_date() {
        let mut cp = test_cp(Some(2));
        let machines = vec![
            machine("m1", vec![cond(MACHINE_CONDITION_UP_TO_DATE, ConditionStatus::True, "")]),
            machine("m2", vec![cond(MACHINE_CONDITION_UP_TO_DATE, ConditionStatus::True, "")]),
        ];
        set_rolling_out_condition(&mut cp, &machines, now());
        let cond = get_condition(&cp, CONDITION_ROLLING_OUT);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, REASON_NOT_ROLLING_OUT);
    }

    #[test]
    fn rolling_out_merges_machine_messages() {
        let mut cp = test_cp(Some(4));
        let machines = vec![
            machine("m1", vec![cond(MACHINE_CONDITION_UP_TO_DATE, ConditionStatus::True, "")]),
            machine("m2", vec![cond(MACHINE_CONDITION_UP_TO_DATE, ConditionStatus::Unknown, "")]),
            machine(
                "m4",
                vec![cond(
                    MACHINE_CONDITION_UP_TO_DATE,
                    ConditionStatus::False,
                    "* Failure domain failure-domain1, failure-domain2 required\n* InfrastructureMachine is not up-to-date",
                )],
            ),
            machine(
                "m3",
                vec![cond(MACHINE_CONDITION_UP_TO_DATE, ConditionStatus::False, "* Version v1.25.0, v1.26.0 required")],
            ),
        ];
        set_rolling_out_condition(&mut cp, &machines, now());
        let cond = get_condition(&cp, CONDITION_ROLLING_OUT);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(
            cond.message,
            "Rolling out 2 not up-to-date replicas\n\
             * Version v1.25.0, v1.26.0 required\n\
             * Failure domain failure-domain1, failure-domain2 required\n\
             * InfrastructureMachine is not up-to-date"
        );
    }

    // MachinesReady & MachinesUpToDate

    #[test]
    fn machines_ready_and_up_to_date_without_machines() {
        let mut cp = test_cp(Some(3));
        set_machines_ready_condition(&mut cp, &[], now());
        set_machines_up_to_date_condition(&mut cp, &[], &Default::default(), now());
        assert_eq!(get_condition(&cp, CONDITION_MACHINES_READY).reason, REASON_NO_REPLICAS);
        assert_eq!(get_condition(&cp, CONDITION_MACHINES_UP_TO_DATE).reason, REASON_NO_REPLICAS);
    }

    #[test]
    fn machines_ready_and_up_to_date_aggregate_issues() {
        let ready_true = || cond(MACHINE_CONDITION_READY, ConditionStatus::True, "");
        let ready_false = || cond(MACHINE_CONDITION_READY, ConditionStatus::False, "NotReady");
        let up_to_date_true = || cond(MACHINE_CONDITION_UP_TO_DATE, ConditionStatus::True, "");
        let up_to_date_false = || cond(MACHINE_CONDITION_UP_TO_DATE, ConditionStatus::False, "NotUpToDate");

        let mut m4 = machine("m4", vec![ready_false()]);
        m4.metadata.creation_timestamp = Some(Time(now() - Duration::minutes(5)));
        let mut m5 = machine("m5", vec![ready_false()]);
        m5.metadata.creation_timestamp = Some(Time(now() - Duration::seconds(5)));
        let machines = vec![
            machine("m1", vec![ready_true(), up_to_date_true()]),
            machine("m2", vec![ready_true(), up_to_date_false()]),
            machine("m3", vec![ready_false(), up_to_date_false()]),
            m4,
            m5,
        ];

        let mut cp = test_cp(Some(5));
        set_machines_ready_condition(&mut cp, &machines, now());
        set_machines_up_to_date_condition(&mut cp, &machines, &Default::default(), now());

        let ready = get_condition(&cp, CONDITION_MACHINES_READY);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.message, "* Machines m3, m4, m5: NotReady");

        let up_to_date = get_condition(&cp, CONDITION_MACHINES_UP_TO_DATE);
        assert_eq!(up_to_date.status, ConditionStatus::False);
        assert_eq!(up_to_date.message, "* Machines m2, m3: NotUpToDate\n* Machine m4: Condition UpToDate not yet reported");
    }

    // Remediating

    #[test]
    fn remediating_true_when_owner_acknowledged() {
        let hc_ok = || cond(MACHINE_CONDITION_HEALTH_CHECK_SUCCEEDED, ConditionStatus::True, "");
        let hc_failed = || cond(MACHINE_CONDITION_HEALTH_CHECK_SUCCEEDED, ConditionStatus::False, "");
        let machines = vec![
            machine("m1", vec![hc_ok()]),
            machine("m2", vec![hc_failed()]),
            machine("m3", vec![hc_failed(), cond(MACHINE_CONDITION_OWNER_REMEDIATED, ConditionStatus::False, "Machine is deleting")]),
        ];
        let mut cp = test_cp(Some(3));
        set_remediating_condition(&mut cp, &machines, now());
        let cond = get_condition(&cp, CONDITION_REMEDIATING);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.message, "* Machine m3: Machine is deleting");
    }

    #[test]
    fn remediating_false_reports_unacknowledged_machines() {
        let hc_ok = || cond(MACHINE_CONDITION_HEALTH_CHECK_SUCCEEDED, ConditionStatus::True, "");
        let hc_failed = || cond(MACHINE_CONDITION_HEALTH_CHECK_SUCCEEDED, ConditionStatus::False, "");

        let mut cp = test_cp(Some(3));
        let machines = vec![machine("m1", vec![hc_ok()]), machine("m2", vec![hc_failed()]), machine("m3", vec![hc_ok()])];
        set_remediating_condition(&mut cp, &machines, now());
        let cond = get_condition(&cp, CONDITION_REMEDIATING);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "Machine m2 is not healthy (not to be remediated by ControlPlane)");

        let machines = vec![machine("m1", vec![hc_failed()]), machine("m2", vec![hc_failed()]), machine("m3", vec![hc_ok()])];
        set_remediating_condition(&mut cp, &machines, now());
        let cond = get_condition(&cp, CONDITION_REMEDIATING);
        assert_eq!(cond.message, "Machines m1, m2 are not healthy (not to be remediated by ControlPlane)");
    }

    // Deleting

    #[test]
    fn deleting_false_without_deletion_timestamp() {
        let mut cp = test_cp(Some(3));
        set_deleting_condition(&mut cp, "WaitingForMachineDeletion", "Deleting 3 Machines", now());
        let cond = get_condition(&cp, CONDITION_DELETING);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, REASON_NOT_DELETING);
    }

    #[test]
    fn deleting_true_reports_progress() {
        let mut cp = deleted(test_cp(Some(3)));
        set_deleting_condition(&mut cp, "WaitingForMachineDeletion", "Deleting 3 Machines", now());
        let cond = get_condition(&cp, CONDITION_DELETING);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, "WaitingForMachineDeletion");
        assert_eq!(cond.message, "Deleting 3 Machines");
    }

    // Available

    #[test]
    fn available_false_when_not_initialized() {
        let mut cp = test_cp(Some(3));
        set_available_condition(&mut cp, &[], &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "Control plane not yet initialized");
    }

    #[test]
    fn available_true_when_all_healthy() {
        let mut cp = initialized_cp();
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1", "m2", "m3"]));
        let machines: Vec<Machine> =
            (1..=3).map(|idx| provisioned(&format!("m{}", idx), healthy_components())).collect();
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert!(cond.message.is_empty());
    }

    #[test]
    fn available_waits_for_etcd_member_report_within_grace() {
        let mut cp = initialized_cp();
        set_initialized_condition(&mut cp, now());
        set_available_condition(&mut cp, &[], &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "Waiting for etcd to report the list of members");
    }

    #[test]
    fn available_unknown_when_etcd_member_report_overdue() {
        let mut cp = initialized_cp();
        set_initialized_condition(&mut cp, now() - Duration::minutes(5));
        set_available_condition(&mut cp, &[], &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::Unknown);
        assert_eq!(cond.reason, REASON_INSPECTION_FAILED);
        assert_eq!(cond.message, "Failed to get etcd members");
    }

    #[test]
    fn available_false_on_member_machine_mismatch() {
        let mut cp = initialized_cp();
        let status = cp.status.as_mut().unwrap();
        status.etcd_members = Some(members(&["m1"]));
        status.etcd_members_agree_with_machines = Some(false);
        set_available_condition(&mut cp, &[], &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "The list of etcd members does not match the list of Machines and Nodes");
    }

    #[test]
    fn available_does_not_surface_fresh_member_issue() {
        let mut cp = initialized_cp();
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1", "m2", "m3"]));
        let mut m3 = provisioned("m3", healthy_components());
        m3.status.as_mut().unwrap().conditions.retain(|cond| cond.type_ != MACHINE_CONDITION_ETCD_MEMBER_HEALTHY);
        m3.status
            .as_mut()
            .unwrap()
            .conditions
            .push(cond_aged(MACHINE_CONDITION_ETCD_MEMBER_HEALTHY, ConditionStatus::False, 0));
        let machines = vec![provisioned("m1", healthy_components()), provisioned("m2", healthy_components()), m3];
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert!(cond.message.is_empty());
    }

    #[test]
    fn available_surfaces_member_issue_past_debounce() {
        let mut cp = initialized_cp();
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1", "m2", "m3"]));
        let mut m3 = provisioned("m3", healthy_components());
        m3.status.as_mut().unwrap().conditions.retain(|cond| cond.type_ != MACHINE_CONDITION_ETCD_MEMBER_HEALTHY);
        m3.status
            .as_mut()
            .unwrap()
            .conditions
            .push(cond_aged(MACHINE_CONDITION_ETCD_MEMBER_HEALTHY, ConditionStatus::False, 11));
        let machines = vec![provisioned("m1", healthy_components()), provisioned("m2", healthy_components()), m3];
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(
            cond.message,
            "* 2 of 3 etcd members are healthy, at least 2 healthy member required for etcd quorum\n\
             * 2 of 3 Machines have healthy control plane components, at least 1 required"
        );
    }

    #[test]
    fn available_false_when_quorum_lost() {
        let mut cp = initialized_cp();
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1", "m2", "m3"]));
        let machines: Vec<Machine> = (1..=3)
            .map(|idx| {
                let mut m = provisioned(&format!("m{}", idx), healthy_components());
                if idx > 1 {
                    m.status.as_mut().unwrap().conditions.retain(|cond| cond.type_ != MACHINE_CONDITION_ETCD_MEMBER_HEALTHY);
                    m.status
                        .as_mut()
                        .unwrap()
                        .conditions
                        .push(cond_aged(MACHINE_CONDITION_ETCD_MEMBER_HEALTHY, ConditionStatus::False, 11));
                }
                m
            })
            .collect();
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::False);
        assert!(cond
            .message
            .contains("* 1 of 3 etcd members is healthy, at least 2 healthy member required for etcd quorum"));
    }

    #[test]
    fn available_treats_nameless_members_as_healthy_non_voting() {
        let mut cp = initialized_cp();
        let mut all = members(&["m1", "m2", "m3"]);
        all.push(EtcdMember { name: String::new(), is_learner: false });
        cp.status.as_mut().unwrap().etcd_members = Some(all);
        let machines: Vec<Machine> = (1..=4)
            .map(|idx| {
                let mut m = provisioned(&format!("m{}", idx), healthy_components());
                if idx >= 3 {
                    m.status.as_mut().unwrap().conditions.retain(|cond| cond.type_ != MACHINE_CONDITION_ETCD_MEMBER_HEALTHY);
                    m.status
                        .as_mut()
                        .unwrap()
                        .conditions
                        .push(cond_aged(MACHINE_CONDITION_ETCD_MEMBER_HEALTHY, ConditionStatus::False, 11));
                }
                m
            })
            .collect();
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(
            cond.message,
            "* 3 of 4 etcd members are healthy, 1 learner etcd member, at least 2 healthy member required for etcd quorum\n\
             * 2 of 4 Machines have healthy control plane components, at least 1 required"
        );
    }

    #[test]
    fn available_excludes_learners_from_quorum() {
        let mut cp = initialized_cp();
        let mut all = members(&["m1", "m2", "m3"]);
        all.push(EtcdMember { name: "m4".into(), is_learner: true });
        cp.status.as_mut().unwrap().etcd_members = Some(all);
        let machines: Vec<Machine> = (1..=4)
            .map(|idx| {
                let mut m = provisioned(&format!("m{}", idx), healthy_components());
                if idx >= 3 {
                    m.status.as_mut().unwrap().conditions.retain(|cond| cond.type_ != MACHINE_CONDITION_ETCD_MEMBER_HEALTHY);
                    m.status
                        .as_mut()
                        .unwrap()
                        .conditions
                        .push(cond_aged(MACHINE_CONDITION_ETCD_MEMBER_HEALTHY, ConditionStatus::False, 11));
                }
                m
            })
            .collect();
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(
            cond.message,
            "* 2 of 4 etcd members are healthy, 1 learner etcd member, at least 2 healthy member required for etcd quorum\n\
             * 2 of 4 Machines have healthy control plane components, at least 1 required"
        );
    }

    #[test]
    fn available_binds_leftover_members_to_provisioning_machines() {
        let mut cp = initialized_cp();
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1", "m2", "m3", "m4"]));
        let mut m3 = provisioned("m3", healthy_components());
        m3.status.as_mut().unwrap().conditions.retain(|cond| cond.type_ != MACHINE_CONDITION_ETCD_MEMBER_HEALTHY);
        m3.status
            .as_mut()
            .unwrap()
            .conditions
            .push(cond_aged(MACHINE_CONDITION_ETCD_MEMBER_HEALTHY, ConditionStatus::False, 11));
        let mut m4 = provisioned("m4", healthy_components());
        m4.status.as_mut().unwrap().node_ref = None;
        let machines = vec![provisioned("m1", healthy_components()), provisioned("m2", healthy_components()), m3, m4];
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(
            cond.message,
            "* 3 of 4 etcd members are healthy, at least 3 healthy member required for etcd quorum\n\
             * 3 of 4 Machines have healthy control plane components, at least 1 required"
        );
    }

    #[test]
    fn available_treats_unbound_members_as_unhealthy() {
        let mut cp = initialized_cp();
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1", "m2", "m3"]));
        let mut m3 = provisioned("m3", healthy_components());
        m3.status.as_mut().unwrap().node_ref = Some(NodeRef { name: "m3-does-not-exist".into() });
        let machines = vec![provisioned("m1", healthy_components()), provisioned("m2", healthy_components()), m3];
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.message, "* 2 of 3 etcd members are healthy, at least 2 healthy member required for etcd quorum");
    }

    #[test]
    fn available_ignores_machines_without_provider_id() {
        let mut cp = initialized_cp();
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1"]));
        let mut m2 = machine("m2", vec![cond("APIServerPodHealthy", ConditionStatus::Unknown, "")]);
        m2.status.as_mut().unwrap().node_ref = Some(NodeRef { name: "m2".into() });
        let machines = vec![provisioned("m1", healthy_components()), m2];
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert!(cond.message.is_empty());
    }

    #[test]
    fn available_false_without_healthy_components() {
        let mut cp = initialized_cp();
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1", "m2", "m3"]));
        let machines: Vec<Machine> = (1..=3)
            .map(|idx| {
                let mut m = provisioned(&format!("m{}", idx), healthy_components());
                m.status.as_mut().unwrap().conditions.retain(|cond| cond.type_ != "APIServerPodHealthy");
                m.status.as_mut().unwrap().conditions.push(cond_aged("APIServerPodHealthy", ConditionStatus::False, 0));
                m
            })
            .collect();
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "* There are no Machines with healthy control plane components, at least 1 required");
    }

    #[test]
    fn available_with_external_etcd_skips_etcd_checks() {
        let mut cp = initialized_cp();
        cp.spec.external_etcd_endpoints = Some(vec!["1.2.3.4".into()]);
        let pods = |healthy: bool, age: i64| -> Vec<Condition> {
            vec![
                cond_aged("APIServerPodHealthy", if healthy { ConditionStatus::True } else { ConditionStatus::False }, age),
                cond("ControllerManagerPodHealthy", ConditionStatus::True, ""),
                cond("SchedulerPodHealthy", ConditionStatus::True, ""),
            ]
        };
        let machines = vec![
            provisioned("m1", pods(true, 0)),
            provisioned("m2", pods(false, 0)),
            provisioned("m3", pods(false, 11)),
        ];
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.message, "* 2 of 3 Machines have healthy control plane components, at least 1 required");
    }

    #[test]
    fn available_tolerates_fresh_component_flake_on_single_machine() {
        let mut cp = initialized_cp();
        cp.spec.external_etcd_endpoints = Some(vec!["1.2.3.4".into()]);
        // The only machine's API server probe flipped 3s ago, well inside the
        // 10s debounce window.
        let machines = vec![provisioned(
            "m1",
            vec![
                cond_aged("APIServerPodHealthy", ConditionStatus::False, 3),
                cond("ControllerManagerPodHealthy", ConditionStatus::True, ""),
                cond("SchedulerPodHealthy", ConditionStatus::True, ""),
            ],
        )];
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::True);
        assert!(cond.message.is_empty());
    }

    #[test]
    fn available_false_when_certificates_unavailable() {
        let mut cp = initialized_cp();
        let status = cp.status.as_mut().unwrap();
        status.etcd_members = Some(members(&["m1"]));
        status.conditions.retain(|cond| cond.type_ != CONDITION_CERTIFICATES_AVAILABLE);
        conditions::set(
            &mut status.conditions,
            Condition::new(CONDITION_CERTIFICATES_AVAILABLE, ConditionStatus::False, "Failed", ""),
            now(),
        );
        let machines = vec![provisioned("m1", healthy_components())];
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "* Control plane certificates are not available");
    }

    #[test]
    fn available_false_when_deleted() {
        let mut cp = deleted(initialized_cp());
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1"]));
        let machines = vec![provisioned("m1", healthy_components())];
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        let cond = get_condition(&cp, CONDITION_AVAILABLE);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, "* Control plane metadata.deletionTimestamp is set");
    }

    // Deprecated mirror

    #[test]
    fn deprecated_status_counts_and_mirrors() {
        let mut cp = initialized_cp();
        cp.status.as_mut().unwrap().etcd_members = Some(members(&["m1", "m2", "m3"]));
        let machines: Vec<Machine> = (1..=3)
            .map(|idx| {
                let mut conds = healthy_components();
                if idx == 1 {
                    conds.push(cond(MACHINE_CONDITION_READY, ConditionStatus::True, ""));
                }
                provisioned(&format!("m{}", idx), conds)
            })
            .collect();
        set_available_condition(&mut cp, &machines, &Default::default(), now());
        set_machines_ready_condition(&mut cp, &machines, now());
        update_deprecated_status(&mut cp, &machines, now());

        let deprecated = cp.status.unwrap().deprecated.unwrap();
        assert_eq!(deprecated.ready_replicas, 1);
        assert_eq!(deprecated.unavailable_replicas, 2);
        let available = deprecated.conditions.iter().find(|cond| cond.type_ == CONDITION_AVAILABLE).unwrap();
        assert_eq!(available.status, ConditionStatus::True);
        assert!(available.reason.is_empty());
        let ready = deprecated.conditions.iter().find(|cond| cond.type_ == CONDITION_MACHINES_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.severity, Some(LegacySeverity::Warning));
    }
}
