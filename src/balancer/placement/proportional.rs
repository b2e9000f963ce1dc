use std::collections::BTreeMap;

use super::{clamp_i32, Placement, PlacementProblems, TargetInfo};

/// Place replicas in proportion to each target's weight.
///
/// Every target first receives its min; the rest is distributed with the D'Hondt method. Once all
/// replicas fit, replicas stuck starting past their deadline are duplicated onto the healthy
/// targets, again by D'Hondt. Stuck targets keep their own count.
pub fn distribute_by_proportions(replicas: i32, infos: &BTreeMap<String, TargetInfo>) -> (Placement, PlacementProblems) {
    let mut problems = PlacementProblems::default();
    let mut placement: Placement = infos.iter().map(|(name, info)| (name.clone(), info.min)).collect();
    let min_sum: i64 = infos.values().map(|info| info.min as i64).sum();
    let mut budget = replicas as i64 - min_sum;
    if budget < 0 {
        problems.missing_replicas = clamp_i32(-budget);
        budget = 0;
    }

    let all_keys: Vec<&str> = infos.keys().map(String::as_str).collect();
    let remaining = dhondt(clamp_i32(budget), &all_keys, infos, &mut placement);
    if remaining > 0 {
        problems.overflow_replicas = remaining;
        return (placement, problems);
    }

    let mut fallback_budget = 0i64;
    for (name, info) in infos.iter() {
        let stuck = info.summary.not_started_within_deadline;
        if stuck == 0 {
            continue;
        }
        let current = placement.get(name).copied().unwrap_or_default();
        let fallback = stuck as i64 + current as i64 - info.summary.total as i64;
        if fallback > 0 {
            fallback_budget += fallback;
        }
    }
    let fallback_budget = clamp_i32(fallback_budget);
    if fallback_budget > 0 {
        let healthy_keys: Vec<&str> = infos
            .iter()
            .filter(|(_, info)| info.summary.not_started_within_deadline == 0)
            .map(|(name, _)| name.as_str())
            .collect();
        problems.overflow_replicas = dhondt(fallback_budget, &healthy_keys, infos, &mut placement);
    }

    (placement, problems)
}

/// Award `budget` replicas among `keys` using the D'Hondt method.
///
/// Each replica goes to the key with the highest `proportion / (1 + current)`, ties broken by
/// ascending name. Keys at their max are skipped. Returns the replicas which could not be placed.
pub(super) fn dhondt(budget: i32, keys: &[&str], infos: &BTreeMap<String, TargetInfo>, placement: &mut Placement) -> i32 {
    let mut keys: Vec<&str> = keys.to_vec();
    keys.sort_unstable();
    keys.dedup();
    keys.retain(|key| infos.contains_key(*key) && placement.contains_key(*key));

    let mut remaining = budget - seed(budget, &keys, infos, placement);
    while remaining > 0 {
        // The best candidate as (name, proportion, current, max).
        let mut best: Option<(&str, i64, i64, i64)> = None;
        for key in keys.iter().copied() {
            let (info, current) = match (infos.get(key), placement.get(key)) {
                (Some(info), Some(current)) => (info, *current),
                _ => continue,
            };
            if current >= info.max {
                continue;
            }
            let (proportion, current) = (info.proportion as i64, current as i64);
            // Compare `p / (1 + c)` against the best without division.
            let better = match best {
                None => true,
                Some((_, best_proportion, best_current, _)) => proportion * (1 + best_current) > best_proportion * (1 + current),
            };
            if better {
                best = Some((key, proportion, current, info.max as i64));
            }
        }
        let (key, proportion, current, max) = match best {
            Some(best) => best,
            None => break,
        };
        // A zero quotient ties with every other candidate, so the same key wins until it is full.
        let award = if proportion == 0 { (max - current).min(remaining as i64) as i32 } else { 1 };
        match placement.get_mut(key) {
            Some(current) => {
                *current += award;
                remaining -= award;
            }
            None => break,
        }
    }
    remaining
}

/// Award up front every replica whose D'Hondt quotient is above a threshold, returning the
/// number awarded.
///
/// The threshold `total / m` is the lowest for which no more than `budget` quotients lie above
/// it. Those quotients are all among the first `budget` the one-at-a-time method would pick, so
/// the final placement is unchanged and fewer than `keys.len()` replicas remain to award.
fn seed(budget: i32, keys: &[&str], infos: &BTreeMap<String, TargetInfo>, placement: &mut Placement) -> i32 {
    // Each key as (name, proportion, current, room below max).
    let entries: Vec<(&str, i128, i128, i128)> = keys
        .iter()
        .filter_map(|key| {
            let (info, current) = (infos.get(*key)?, *placement.get(*key)?);
            let room = (info.max as i128 - current as i128).max(0);
            Some((*key, info.proportion as i128, current as i128, room))
        })
        .collect();
    if budget <= 0 || entries.iter().any(|(_, proportion, current, _)| *proportion < 0 || *current < 0) {
        return 0;
    }
    let total: i128 = entries.iter().map(|(_, proportion, _, _)| proportion).sum();
    if total == 0 {
        return 0;
    }

    // Quotients of a key above `total / m`, counting from its current value.
    let above = |proportion: i128, current: i128, room: i128, m: i128| -> i128 {
        let seats = if proportion * m >= 1 { (proportion * m - 1) / total } else { 0 };
        (seats - current).max(0).min(room)
    };
    let count = |m: i128| -> i128 { entries.iter().map(|(_, proportion, current, room)| above(*proportion, *current, *room, m)).sum() };

    let budget = budget as i128;
    let max_current = entries.iter().map(|(_, _, current, _)| *current).max().unwrap_or(0);
    let (mut lo, mut hi) = (0i128, total * (budget + max_current + 1) + 1);
    if count(hi) <= budget {
        lo = hi;
    } else {
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if count(mid) <= budget {
                lo = mid;
            } else {
                hi = mid;
            }
        }
    }

    let mut awarded = 0i128;
    for (key, proportion, current, room) in entries.iter() {
        let seats = above(*proportion, *current, *room, lo);
        if let Some(val) = placement.get_mut(*key) {
            *val += seats as i32;
            awarded += seats;
        }
    }
    awarded as i32
}
