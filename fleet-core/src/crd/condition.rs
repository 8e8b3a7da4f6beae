//! Status conditions.
//!
//! Conditions are kept as a list on each object's status. All writes go through the helpers of
//! this module, which only bump a condition's transition time when its status actually changes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Summary condition derived from all other conditions of an object.
pub const READY: &str = "Ready";
/// The scale set is running.
pub const SCALE_SET_RUNNING: &str = "ScaleSetRunning";
/// The scale set's instances are on the latest model.
pub const SCALE_SET_MODEL_UPDATED: &str = "ScaleSetModelUpdated";
/// The scale set has the desired number of ready replicas.
pub const SCALE_SET_DESIRED_REPLICAS: &str = "ScaleSetDesiredReplicas";
/// The scale set and its bootstrap extension were successfully provisioned.
pub const BOOTSTRAP_SUCCEEDED: &str = "BootstrapSucceeded";
/// The instance backing a machine is running.
pub const VM_RUNNING: &str = "VMRunning";

pub const REASON_CREATING: &str = "Creating";
pub const REASON_UPDATING: &str = "Updating";
pub const REASON_DELETING: &str = "Deleting";
pub const REASON_DELETED: &str = "Deleted";
pub const REASON_FAILED: &str = "Failed";
pub const REASON_DELETION_FAILED: &str = "DeletionFailed";
pub const REASON_SCALE_UP: &str = "ScaleSetScaleUp";
pub const REASON_SCALE_DOWN: &str = "ScaleSetScaleDown";
pub const REASON_MODEL_OUT_OF_DATE: &str = "ScaleSetModelOutOfDate";

/// The status of a condition.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// The severity of a condition which is not `True`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, JsonSchema)]
pub enum ConditionSeverity {
    Info,
    Warning,
    Error,
}

/// An observation of an object's state.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// The type of this condition.
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub severity: Option<ConditionSeverity>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Get the condition of the given type.
pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|cond| cond.type_ == type_)
}

/// Check if the condition of the given type is present and `True`.
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    matches!(get(conditions, type_), Some(cond) if cond.status == ConditionStatus::True)
}

/// Set the condition of the given type to `True`.
pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set(
        conditions,
        Condition {
            type_: type_.into(),
            status: ConditionStatus::True,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: None,
        },
    );
}

/// Set the condition of the given type to `False`.
pub fn mark_false(conditions: &mut Vec<Condition>, type_: &str, reason: &str, severity: ConditionSeverity, message: impl Into<String>) {
    let message = message.into();
    set(
        conditions,
        Condition {
            type_: type_.into(),
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: Some(reason.into()),
            message: if message.is_empty() { None } else { Some(message) },
            last_transition_time: None,
        },
    );
}

/// Upsert the given condition.
fn set(conditions: &mut Vec<Condition>, mut cond: Condition) {
    match conditions.iter_mut().find(|existing| existing.type_ == cond.type_) {
        Some(existing) => {
            cond.last_transition_time = if existing.status == cond.status {
                existing.last_transition_time
            } else {
                Some(Utc::now())
            };
            *existing = cond;
        }
        None => {
            cond.last_transition_time = Some(Utc::now());
            conditions.push(cond);
        }
    }
}

/// Derive the `Ready` summary condition from all other conditions.
///
/// The summary is `True` when every other condition is `True`. Otherwise it mirrors the reason and
/// message of the most severe non-`True` condition.
pub fn set_summary(conditions: &mut Vec<Condition>) {
    let worst = conditions
        .iter()
        .filter(|cond| cond.type_ != READY && cond.status != ConditionStatus::True)
        .max_by_key(|cond| cond.severity.unwrap_or(ConditionSeverity::Info))
        .cloned();
    match worst {
        None => mark_true(conditions, READY),
        Some(cond) => mark_false(
            conditions,
            READY,
            cond.reason.as_deref().unwrap_or_default(),
            cond.severity.unwrap_or(ConditionSeverity::Info),
            cond.message.unwrap_or_default(),
        ),
    }
}
