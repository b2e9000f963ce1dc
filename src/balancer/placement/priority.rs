use std::collections::BTreeMap;

use super::{clamp_i32, Placement, PlacementProblems, TargetInfo};

/// Place replicas by walking targets in priority order, filling each one up to its max.
///
/// Every target first receives its min. When a target has pods stuck starting past their
/// deadline, the stuck replicas not already compensated elsewhere are carried over to the next
/// targets in the order. The stuck target keeps its own count, so the total placement may exceed
/// `replicas`.
pub fn distribute_by_priority(mut replicas: i32, priorities: &[String], infos: &BTreeMap<String, TargetInfo>) -> (Placement, PlacementProblems) {
    let mut problems = PlacementProblems::default();
    let mut placement: Placement = infos
        .iter()
        .map(|(name, info)| {
            replicas = replicas.saturating_sub(info.min);
            (name.clone(), info.min)
        })
        .collect();
    if replicas < 0 {
        problems.missing_replicas = -replicas;
        replicas = 0;
    }

    for name in priorities {
        let (info, current) = match (infos.get(name), placement.get_mut(name)) {
            (Some(info), Some(current)) => (info, current),
            _ => continue,
        };
        let free = info.max.saturating_sub(*current).max(0);
        if replicas <= free {
            *current += replicas;
            replicas = 0;
        } else {
            *current += free;
            replicas -= free;
        }

        if info.summary.not_started_within_deadline > 0 {
            let fallback = info.summary.not_started_within_deadline as i64 + *current as i64 - info.summary.total as i64;
            if fallback > 0 {
                replicas = replicas.saturating_add(clamp_i32(fallback));
            }
        }
    }

    problems.overflow_replicas = replicas;
    (placement, problems)
}
