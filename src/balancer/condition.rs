//! Management of the `Balancing` status condition.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use crate::balancer::PhasedError;

/// The type of the single condition maintained on Balancers.
pub const CONDITION_BALANCING: &str = "Balancing";
/// The reason recorded on success.
pub const REASON_COMPLETED: &str = "Completed";
/// The message recorded on success.
pub const MESSAGE_RUNNING_OK: &str = "Balancer running OK";

const STATUS_TRUE: &str = "True";
const STATUS_FALSE: &str = "False";

/// Record the outcome of a reconciliation in the `Balancing` condition.
///
/// The transition time only moves when the condition's status flips. The condition is appended
/// if not yet present.
pub fn set_balancing_condition(conditions: &mut Vec<Condition>, outcome: Option<&PhasedError>, now: DateTime<Utc>) {
    let (status, reason, message) = match outcome {
        None => (STATUS_TRUE, REASON_COMPLETED.to_string(), MESSAGE_RUNNING_OK.to_string()),
        Some(err) => (STATUS_FALSE, err.phase.to_string(), err.to_string()),
    };

    match conditions.iter_mut().find(|cond| cond.type_ == CONDITION_BALANCING) {
        Some(cond) => {
            if cond.status != status {
                cond.last_transition_time = Time(now);
            }
            cond.status = status.into();
            cond.reason = reason;
            cond.message = message;
        }
        None => conditions.push(Condition {
            type_: CONDITION_BALANCING.into(),
            status: status.into(),
            reason,
            message,
            last_transition_time: Time(now),
            observed_generation: None,
        }),
    }
}

/// Find the `Balancing` condition, if present.
#[cfg(test)]
pub fn balancing_condition(conditions: &[Condition]) -> Option<&Condition> {
    conditions.iter().find(|cond| cond.type_ == CONDITION_BALANCING)
}
