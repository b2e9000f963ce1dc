use std::collections::BTreeMap;

use anyhow::Result;
use maplit::btreemap;

use super::*;
use crate::balancer::pods::Summary;
use crate::crd::{BalancerPolicy, PriorityPolicy, ProportionalPolicy};
use crate::fixtures::{balancer, priority_policy, proportional_policy, target};

fn no_summaries() -> BTreeMap<String, Summary> {
    BTreeMap::new()
}

#[test]
fn dispatches_priority_policy() -> Result<()> {
    let balancer = balancer(10, vec![target("a", None, Some(3)), target("b", None, Some(4))], priority_policy(&["a", "b"]));
    let (placement, problems) = get_placement(&balancer, &no_summaries())?;
    assert_eq!(placement, btreemap! {"a".into() => 3, "b".into() => 4});
    assert_eq!(problems.overflow_replicas, 3);
    Ok(())
}

#[test]
fn dispatches_proportional_policy() -> Result<()> {
    let balancer = balancer(10, vec![target("a", None, None), target("b", None, None)], proportional_policy(&[("a", 30), ("b", 70)]));
    let (placement, problems) = get_placement(&balancer, &no_summaries())?;
    assert_eq!(placement, btreemap! {"a".into() => 3, "b".into() => 7});
    assert_eq!(problems, PlacementProblems::default());
    Ok(())
}

#[test]
fn proportions_default_to_zero_for_unlisted_targets() -> Result<()> {
    let balancer = balancer(
        4,
        vec![target("a", None, None), target("b", Some(1), None), target("c", None, None)],
        proportional_policy(&[("a", 1), ("c", 1)]),
    );
    let (placement, _) = get_placement(&balancer, &no_summaries())?;
    assert_eq!(placement, btreemap! {"a".into() => 2, "b".into() => 1, "c".into() => 1});
    Ok(())
}

#[test]
fn summaries_flow_into_fallback() -> Result<()> {
    let balancer = balancer(10, vec![target("a", None, None), target("b", None, None)], priority_policy(&["a", "b"]));
    let summaries = btreemap! {
        "a".to_string() => Summary { total: 3, running: 1, not_started_within_deadline: 2 },
    };
    let (placement, _) = get_placement(&balancer, &summaries)?;
    assert_eq!(placement, btreemap! {"a".into() => 10, "b".into() => 9});
    Ok(())
}

#[test]
fn priority_without_order_is_incomplete() {
    let policy = BalancerPolicy {
        policy_name: "priority".into(),
        priorities: Some(PriorityPolicy { target_order: None }),
        ..Default::default()
    };
    let balancer = balancer(1, vec![target("a", None, None), target("b", None, None)], policy);
    let err = get_placement(&balancer, &no_summaries()).unwrap_err();
    assert!(matches!(err, PlacementError::IncompletePolicy(_)), "unexpected error {:?}", err);
    assert!(err.to_string().starts_with("incomplete policy definition"));
}

#[test]
fn proportional_without_proportions_is_incomplete() {
    let policy = BalancerPolicy {
        policy_name: "proportional".into(),
        proportions: Some(ProportionalPolicy { target_proportions: None }),
        ..Default::default()
    };
    let balancer = balancer(1, vec![target("a", None, None), target("b", None, None)], policy);
    let err = get_placement(&balancer, &no_summaries()).unwrap_err();
    assert!(matches!(err, PlacementError::IncompletePolicy(_)), "unexpected error {:?}", err);
}

#[test]
fn unknown_policy_is_not_supported() {
    let policy = BalancerPolicy {
        policy_name: "roundrobin".into(),
        ..Default::default()
    };
    let balancer = balancer(1, vec![target("a", None, None), target("b", None, None)], policy);
    let err = get_placement(&balancer, &no_summaries()).unwrap_err();
    assert_eq!(err, PlacementError::UnsupportedPolicy("roundrobin".into()));
}

#[test]
fn priority_order_must_reference_declared_targets() {
    let balancer = balancer(1, vec![target("a", None, None), target("b", None, None)], priority_policy(&["a", "z"]));
    let err = get_placement(&balancer, &no_summaries()).unwrap_err();
    assert_eq!(err, PlacementError::UnknownTarget("z".into()));

    let balancer = crate::fixtures::balancer(1, vec![target("a", None, None), target("b", None, None)], priority_policy(&["a", "a"]));
    let err = get_placement(&balancer, &no_summaries()).unwrap_err();
    assert_eq!(err, PlacementError::DuplicateTarget("a".into()));
}

#[test]
fn priority_order_must_list_every_target() {
    let balancer = balancer(5, vec![target("a", None, None), target("b", Some(2), None)], priority_policy(&["a"]));
    let err = get_placement(&balancer, &no_summaries()).unwrap_err();
    assert!(matches!(err, PlacementError::IncompletePolicy(_)), "unexpected error {:?}", err);
    assert!(err.to_string().contains("must list every target"));
}
