//! Pod summaries.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;

const PHASE_RUNNING: &str = "Running";
const PHASE_PENDING: &str = "Pending";

/// Counts of the pods observed for a single target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// The number of running and pending pods.
    pub total: i32,
    /// The number of running pods.
    pub running: i32,
    /// The number of pending pods which have exceeded the startup deadline.
    pub not_started_within_deadline: i32,
}

/// Summarize the given pods.
///
/// A pending pod counts as not started within the deadline once more than `startup_deadline`
/// has elapsed since its creation. A `None` deadline disables the check. Pods in any phase other
/// than `Running` or `Pending` are ignored.
pub fn summarize<'a>(pods: impl IntoIterator<Item = &'a Pod>, now: DateTime<Utc>, startup_deadline: Option<Duration>) -> Summary {
    let mut summary = Summary::default();
    for pod in pods {
        match pod.status.as_ref().and_then(|status| status.phase.as_deref()) {
            Some(PHASE_RUNNING) => {
                summary.total += 1;
                summary.running += 1;
            }
            Some(PHASE_PENDING) => {
                summary.total += 1;
                let created = pod.metadata.creation_timestamp.as_ref().map(|ts| ts.0);
                if let (Some(deadline), Some(created)) = (startup_deadline, created) {
                    if now - created > deadline {
                        summary.not_started_within_deadline += 1;
                    }
                }
            }
            _ => (),
        }
    }
    summary
}
