//! Remediation ledger.
//!
//! Remediation progress is tracked through JSON annotation payloads: an
//! in-progress payload on the control plane itself, and historical payloads on
//! the machines created to replace remediated ones. The most relevant payload
//! is surfaced as `status.lastRemediation`.

use chrono::{DateTime, Utc};
use kube::Resource;
use serde::{Deserialize, Serialize};

use helmsman_core::crd::{ControlPlane, LastRemediationStatus, Machine, RequiredMetadata};
use helmsman_core::{ANNOTATION_REMEDIATION_FOR, ANNOTATION_REMEDIATION_IN_PROGRESS};

/// The annotation payload recording a remediation.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationData {
    /// The name of the machine which was remediated.
    pub machine: String,
    /// When the remediation was initiated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// How many times remediation of the same machine has been retried.
    #[serde(default)]
    pub retry_count: i32,
}

impl RemediationData {
    fn into_status(self) -> LastRemediationStatus {
        LastRemediationStatus {
            machine: self.machine,
            time: self.timestamp,
            retry_count: self.retry_count,
        }
    }
}

/// Set `status.lastRemediation` on the control plane from the annotation ledger.
///
/// An in-progress payload on the control plane itself takes precedence over
/// historical per-machine payloads; among those, the most recent by timestamp
/// wins. Malformed payloads are logged and treated as absent.
pub fn set_last_remediation(cp: &mut ControlPlane, machines: &[Machine]) {
    let in_progress = cp
        .meta()
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_REMEDIATION_IN_PROGRESS))
        .and_then(|payload| parse_payload(payload, cp.name()));
    let last = match in_progress {
        Some(data) => Some(data),
        None => machines
            .iter()
            .filter_map(|machine| {
                machine
                    .meta()
                    .annotations
                    .as_ref()
                    .and_then(|annotations| annotations.get(ANNOTATION_REMEDIATION_FOR))
                    .and_then(|payload| parse_payload(payload, machine.name()))
            })
            .max_by_key(|data| data.timestamp),
    };

    let status = cp.status.get_or_insert_with(Default::default);
    status.last_remediation = last.map(RemediationData::into_status);
}

fn parse_payload(payload: &str, owner: &str) -> Option<RemediationData> {
    match serde_json::from_str::<RemediationData>(payload) {
        Ok(data) => Some(data),
        Err(err) => {
            tracing::warn!(error = ?err, owner, "malformed remediation annotation payload, ignoring");
            None
        }
    }
}
