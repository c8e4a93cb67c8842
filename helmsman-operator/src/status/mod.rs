//! Status synthesis.
//!
//! Everything here is pure: each routine takes observed objects plus the
//! current time and writes conditions/counters onto the in-memory copy of the
//! target object. The engine applies the result through the status
//! subresource afterwards.

pub mod control_plane;
pub mod topology;

use chrono::Duration;

use crate::config::Config;

/// Time thresholds applied while synthesizing status.
///
/// All of these exist to keep roll-up conditions stable across single-tick
/// flakes and normal propagation delays.
pub struct StatusPolicy {
    /// How long a control plane component may be unhealthy before it is
    /// surfaced on an otherwise available control plane.
    pub component_health_debounce: Duration,
    /// How long a machine may be in deletion before it is reported as stale.
    pub stale_deletion_threshold: Duration,
    /// How long after machine creation a missing UpToDate condition is tolerated.
    pub machine_creation_grace: Duration,
    /// How long after control plane initialization a missing etcd member report
    /// is tolerated.
    pub etcd_report_grace: Duration,
}

impl StatusPolicy {
    /// Build the policy from runtime config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            component_health_debounce: Duration::seconds(config.component_health_debounce_seconds as i64),
            stale_deletion_threshold: Duration::seconds(config.stale_deletion_threshold_seconds as i64),
            machine_creation_grace: Duration::seconds(config.machine_creation_grace_seconds as i64),
            etcd_report_grace: Duration::seconds(config.etcd_report_grace_seconds as i64),
        }
    }
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            component_health_debounce: Duration::seconds(10),
            stale_deletion_threshold: Duration::seconds(900),
            machine_creation_grace: Duration::seconds(10),
            etcd_report_grace: Duration::seconds(120),
        }
    }
}

/// Render a name list, eliding everything past the first five entries.
pub(crate) fn name_list(names: &[String]) -> String {
    if names.len() > 5 {
        format!("{}, ...", names[..5].join(", "))
    } else {
        names.join(", ")
    }
}

/// "Machine" or "Machines" depending on count.
pub(crate) fn machine_noun(count: usize) -> &'static str {
    if count == 1 {
        "Machine"
    } else {
        "Machines"
    }
}

/// A per-machine issue to be rolled up into an aggregate condition message.
pub(crate) struct MachineIssue {
    pub machine: String,
    pub message: String,
}

/// Roll per-machine issues up into bullet lines.
///
/// Machines reporting the same message are grouped onto one line. Groups are
/// ordered by descending machine count, then by first machine name; names
/// within a group are sorted.
pub(crate) fn aggregate_machine_issues(issues: &[MachineIssue]) -> String {
    use std::collections::BTreeMap;
    let mut by_message: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for issue in issues {
        by_message.entry(issue.message.as_str()).or_default().push(issue.machine.as_str());
    }
    let mut groups: Vec<(Vec<&str>, &str)> = by_message
        .into_iter()
        .map(|(message, mut names)| {
            names.sort_unstable();
            (names, message)
        })
        .collect();
    groups.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0[0].cmp(b.0[0])));
    groups
        .iter()
        .map(|(names, message)| {
            let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
            format!("* {} {}: {}", machine_noun(names.len()), name_list(&names), message)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
