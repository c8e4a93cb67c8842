//! Condition primitives shared by all Helmsman CRDs.
//!
//! Two representations are maintained in parallel: the current `Condition`
//! form, and the deprecated `LegacyCondition` form kept for older consumers.
//! Both are always written from the same canonical evaluation, never derived
//! from one another.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The status of a condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Default for ConditionStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// An observation of the state of an object.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// The type of this condition.
    #[serde(rename = "type")]
    pub type_: String,
    /// The status of this condition.
    pub status: ConditionStatus,
    /// A programmatic identifier indicating the reason for the condition's last transition.
    pub reason: String,
    /// A human readable message indicating details about the transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// The last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Construct a new condition without a transition time.
    ///
    /// The transition time is stamped by [`set`] when the condition is recorded.
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    /// Check if this condition's status is `True`.
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// The severity of a legacy condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum LegacySeverity {
    Error,
    Warning,
    Info,
}

/// The deprecated condition representation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCondition {
    /// The type of this condition.
    #[serde(rename = "type")]
    pub type_: String,
    /// The status of this condition.
    pub status: ConditionStatus,
    /// The reason for the condition's last transition. Empty for `True` conditions.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// How the condition should be treated when its status is not `True`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<LegacySeverity>,
    /// A human readable message indicating details about the transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// The last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl LegacyCondition {
    /// Construct a `True` legacy condition, which carries no reason per the deprecated contract.
    pub fn truthy(type_: &str) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::True,
            reason: String::new(),
            severity: None,
            message: String::new(),
            last_transition_time: None,
        }
    }

    /// Construct a `False` legacy condition.
    pub fn falsy(type_: &str, reason: &str, severity: LegacySeverity, message: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::False,
            reason: reason.into(),
            severity: Some(severity),
            message: message.into(),
            last_transition_time: None,
        }
    }
}

/// Get the condition of the given type, if present.
pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|cond| cond.type_ == type_)
}

/// Check if the condition of the given type is present with status `True`.
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).map(Condition::is_true).unwrap_or(false)
}

/// Record the given condition, preserving the last transition time when the status is unchanged.
///
/// Reason and message updates alone never move the transition timestamp.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    match conditions.iter_mut().find(|cond| cond.type_ == condition.type_) {
        Some(old) => {
            condition.last_transition_time = if old.status == condition.status {
                old.last_transition_time.or(Some(now))
            } else {
                Some(now)
            };
            *old = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
}

/// Record the given legacy condition with the same transition time semantics as [`set`].
pub fn set_legacy(conditions: &mut Vec<LegacyCondition>, mut condition: LegacyCondition, now: DateTime<Utc>) {
    match conditions.iter_mut().find(|cond| cond.type_ == condition.type_) {
        Some(old) => {
            condition.last_transition_time = if old.status == condition.status {
                old.last_transition_time.or(Some(now))
            } else {
                Some(now)
            };
            *old = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp(secs, 0)
    }

    #[test]
    fn set_stamps_transition_time_on_first_write() {
        let mut conds = vec![];
        set(&mut conds, Condition::new("Available", ConditionStatus::True, "Available", ""), ts(100));
        assert_eq!(conds[0].last_transition_time, Some(ts(100)));
    }

    #[test]
    fn set_preserves_transition_time_when_status_unchanged() {
        let mut conds = vec![];
        set(&mut conds, Condition::new("Available", ConditionStatus::False, "NotAvailable", "a"), ts(100));
        set(&mut conds, Condition::new("Available", ConditionStatus::False, "Blocked", "b"), ts(200));
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].reason, "Blocked");
        assert_eq!(conds[0].message, "b");
        assert_eq!(conds[0].last_transition_time, Some(ts(100)));
    }

    #[test]
    fn set_updates_transition_time_on_status_change() {
        let mut conds = vec![];
        set(&mut conds, Condition::new("Available", ConditionStatus::False, "NotAvailable", ""), ts(100));
        set(&mut conds, Condition::new("Available", ConditionStatus::True, "Available", ""), ts(200));
        assert_eq!(conds[0].last_transition_time, Some(ts(200)));
    }

    #[test]
    fn set_is_idempotent() {
        let mut conds = vec![];
        let cond = Condition::new("Ready", ConditionStatus::True, "Ready", "all good");
        set(&mut conds, cond.clone(), ts(100));
        let snapshot = conds.clone();
        set(&mut conds, cond, ts(500));
        assert_eq!(conds, snapshot);
    }

    #[test]
    fn set_legacy_matches_set_semantics() {
        let mut conds = vec![];
        set_legacy(&mut conds, LegacyCondition::falsy("Ready", "Deleted", LegacySeverity::Info, ""), ts(100));
        set_legacy(&mut conds, LegacyCondition::falsy("Ready", "Deleted", LegacySeverity::Info, ""), ts(200));
        assert_eq!(conds[0].last_transition_time, Some(ts(100)));
        set_legacy(&mut conds, LegacyCondition::truthy("Ready"), ts(300));
        assert_eq!(conds[0].last_transition_time, Some(ts(300)));
        assert!(conds[0].reason.is_empty());
    }
}
