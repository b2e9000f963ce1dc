//! Replica placement.
//!
//! A placement maps each target name to the number of replicas it should have. Placement is
//! computed fresh on every reconciliation from the Balancer's spec and the current pod summaries;
//! the algorithms here are pure functions over value inputs.

mod priority;
mod proportional;
#[cfg(test)]
mod mod_test;

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::balancer::pods::Summary;
use crate::crd::{Balancer, POLICY_PRIORITY, POLICY_PROPORTIONAL};

pub use priority::distribute_by_priority;
pub use proportional::distribute_by_proportions;

/// The effective maximum of targets which do not declare one.
///
/// Never reached by a real placement; it removes the need for optional maxima in the algorithms.
pub const MAX_REPLICAS: i32 = i32::MAX;

/// Target name to replica count.
pub type Placement = BTreeMap<String, i32>;

/// Everything the placement algorithms need to know about one target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetInfo {
    pub min: i32,
    pub max: i32,
    /// The weight of the target under the proportional policy.
    pub proportion: i32,
    pub summary: Summary,
}

/// Replicas which could not be placed as requested.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlacementProblems {
    /// Replicas added beyond the desired total in order to honor target minimums.
    pub missing_replicas: i32,
    /// Replicas which did not fit under the target maximums.
    pub overflow_replicas: i32,
}

/// Placement errors.
#[derive(Debug, Error, PartialEq)]
pub enum PlacementError {
    /// The policy is missing the details it needs.
    #[error("incomplete policy definition: {0}")]
    IncompletePolicy(&'static str),
    /// The policy name is not one of the supported policies.
    #[error("policy not supported: {0:?}")]
    UnsupportedPolicy(String),
    /// The policy references a target which the Balancer does not declare.
    #[error("unknown target in policy: {0:?}")]
    UnknownTarget(String),
    /// The priority order lists a target more than once.
    #[error("target listed more than once in policy: {0:?}")]
    DuplicateTarget(String),
}

/// Compute the placement for the given Balancer.
///
/// A priority order must list every declared target exactly once. `summaries` holds the pod summary of each target by name; targets without a summary are
/// treated as having no pods.
pub fn get_placement(balancer: &Balancer, summaries: &BTreeMap<String, Summary>) -> Result<(Placement, PlacementProblems), PlacementError> {
    let spec = &balancer.spec;
    let mut infos: BTreeMap<String, TargetInfo> = spec
        .targets
        .iter()
        .map(|target| {
            let info = TargetInfo {
                min: target.min_replicas.unwrap_or(0),
                max: target.max_replicas.unwrap_or(MAX_REPLICAS),
                proportion: 0,
                summary: summaries.get(&target.name).copied().unwrap_or_default(),
            };
            (target.name.clone(), info)
        })
        .collect();

    match spec.policy.policy_name.as_str() {
        POLICY_PRIORITY => {
            let order = spec
                .policy
                .priorities
                .as_ref()
                .and_then(|priorities| priorities.target_order.as_ref())
                .ok_or(PlacementError::IncompletePolicy("priorities.targetOrder is required"))?;
            let mut seen = HashSet::new();
            for name in order {
                if !infos.contains_key(name) {
                    return Err(PlacementError::UnknownTarget(name.clone()));
                }
                if !seen.insert(name) {
                    return Err(PlacementError::DuplicateTarget(name.clone()));
                }
            }
            if seen.len() != infos.len() {
                return Err(PlacementError::IncompletePolicy("priorities.targetOrder must list every target"));
            }
            Ok(distribute_by_priority(spec.replicas, order, &infos))
        }
        POLICY_PROPORTIONAL => {
            let proportions = spec
                .policy
                .proportions
                .as_ref()
                .and_then(|proportions| proportions.target_proportions.as_ref())
                .ok_or(PlacementError::IncompletePolicy("proportions.targetProportions is required"))?;
            for (name, info) in infos.iter_mut() {
                info.proportion = proportions.get(name).copied().unwrap_or(0);
            }
            Ok(distribute_by_proportions(spec.replicas, &infos))
        }
        other => Err(PlacementError::UnsupportedPolicy(other.into())),
    }
}

/// Narrow the given value to an `i32`, saturating at the bounds.
fn clamp_i32(val: i64) -> i32 {
    val.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}
