//! Shared types used across Scribe CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting whether the last reconcile pass succeeded
pub const CONDITION_RECONCILED: &str = "Reconciled";

/// Reason used when a reconcile pass completed without error
pub const REASON_RECONCILE_COMPLETE: &str = "ReconcileComplete";

/// Reason used when a reconcile pass returned an error
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Reconciled)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Reconciled=True / ReconcileComplete
    pub fn reconcile_complete() -> Self {
        Self::new(
            CONDITION_RECONCILED,
            ConditionStatus::True,
            REASON_RECONCILE_COMPLETE,
            "Reconcile complete",
        )
    }

    /// Reconciled=False / ReconcileError carrying the error text verbatim
    pub fn reconcile_error(message: impl Into<String>) -> Self {
        Self::new(
            CONDITION_RECONCILED,
            ConditionStatus::False,
            REASON_RECONCILE_ERROR,
            message,
        )
    }
}

/// Insert or update a condition by type.
///
/// The existing `lastTransitionTime` is kept unless the status flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// How a point-in-time copy of the source volume is taken before syncing
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CopyMethod {
    /// Sync directly from the source PVC
    #[default]
    None,
    /// Clone the source PVC via a `dataSource` reference
    Clone,
    /// Take a VolumeSnapshot and restore it into a fresh PVC
    Snapshot,
}

impl std::fmt::Display for CopyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Clone => write!(f, "Clone"),
            Self::Snapshot => write!(f, "Snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// Story: a repeated success keeps the original transition time
    #[test]
    fn story_same_status_keeps_transition_time() {
        let mut conditions = Vec::new();
        let mut first = Condition::reconcile_complete();
        first.last_transition_time = at(100);
        set_condition(&mut conditions, first);

        let mut second = Condition::reconcile_complete();
        second.last_transition_time = at(500);
        set_condition(&mut conditions, second);

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, at(100));
    }

    /// Story: flipping to an error records a new transition and the message
    #[test]
    fn story_status_flip_updates_transition_time() {
        let mut conditions = Vec::new();
        let mut ok = Condition::reconcile_complete();
        ok.last_transition_time = at(100);
        set_condition(&mut conditions, ok);

        let mut failed = Condition::reconcile_error("secret missing");
        failed.last_transition_time = at(200);
        set_condition(&mut conditions, failed);

        let cond = find_condition(&conditions, CONDITION_RECONCILED).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, REASON_RECONCILE_ERROR);
        assert_eq!(cond.message, "secret missing");
        assert_eq!(cond.last_transition_time, at(200));
    }

    #[test]
    fn test_message_update_without_flip() {
        let mut conditions = vec![Condition::reconcile_error("first")];
        set_condition(&mut conditions, Condition::reconcile_error("second"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "second");
    }

    #[test]
    fn test_other_condition_types_untouched() {
        let mut conditions = vec![Condition::new(
            "Synchronizing",
            ConditionStatus::True,
            "Running",
            "",
        )];
        set_condition(&mut conditions, Condition::reconcile_complete());
        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, "Synchronizing").is_some());
    }

    #[test]
    fn test_condition_serializes_with_k8s_field_names() {
        let json = serde_json::to_value(Condition::reconcile_complete()).unwrap();
        assert_eq!(json["type"], "Reconciled");
        assert_eq!(json["status"], "True");
        assert_eq!(json["reason"], "ReconcileComplete");
        assert!(json.get("lastTransitionTime").is_some());
    }

    #[test]
    fn test_copy_method_default_and_display() {
        assert_eq!(CopyMethod::default(), CopyMethod::None);
        assert_eq!(CopyMethod::Snapshot.to_string(), "Snapshot");
    }
}
