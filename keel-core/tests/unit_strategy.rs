//! Unit tests for resource assignment strategies
//!
//! Tests block layout, determinism, and edge cases.

use keel_core::coordinator::{Decision, Participant, Resource, RoundRobin, Strategy, StrategyFn};

fn participants(endpoints: &[&str]) -> Vec<Participant> {
    endpoints
        .iter()
        .map(|e| Participant::new(*e, 1).unwrap())
        .collect()
}

fn resources(names: &[&str]) -> Vec<Resource> {
    names.iter().map(|n| Resource::new("mysql", *n)).collect()
}

fn names(decision: &Decision, endpoint: &str) -> Vec<String> {
    decision
        .resources_for(endpoint)
        .unwrap_or_default()
        .iter()
        .map(|r| r.name.clone())
        .collect()
}

#[test]
fn test_basic_assignment() {
    let decision = RoundRobin.assign(
        &participants(&["h1:1", "h2:1", "h3:1"]),
        &resources(&["r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9"]),
    );

    for endpoint in ["h1:1", "h2:1", "h3:1"] {
        assert!(!names(&decision, endpoint).is_empty(), "{} has no resources", endpoint);
    }
    assert_eq!(decision.resource_count(), 10);
    assert!(decision.is_exclusive());
    assert!(decision.is_canonical());
}

#[test]
fn test_blocks_are_contiguous_and_front_loaded() {
    let decision = RoundRobin.assign(
        &participants(&["p2:1", "p1:1"]),
        &resources(&["e", "c", "a", "d", "b"]),
    );

    assert_eq!(names(&decision, "p1:1"), vec!["a", "b", "c"]);
    assert_eq!(names(&decision, "p2:1"), vec!["d", "e"]);
}

#[test]
fn test_deterministic_assignment() {
    let ps = participants(&["a:1", "b:1", "c:1", "d:1"]);
    let rs: Vec<Resource> = (0..100)
        .map(|i| Resource::new("pg", format!("db-{:03}", i)))
        .collect();

    let first = RoundRobin.assign(&ps, &rs);
    let mut reversed = rs.clone();
    reversed.reverse();
    let second = RoundRobin.assign(&ps, &reversed);

    assert!(first.equals(&second), "Assignment should not depend on input order");
}

#[test]
fn test_single_participant() {
    let rs = resources(&["a", "b", "c"]);
    let decision = RoundRobin.assign(&participants(&["solo:1"]), &rs);

    assert_eq!(names(&decision, "solo:1"), vec!["a", "b", "c"]);
}

#[test]
fn test_empty_participants() {
    let decision = RoundRobin.assign(&[], &resources(&["a", "b"]));
    assert!(decision.is_empty());
}

#[test]
fn test_more_participants_than_resources() {
    let decision = RoundRobin.assign(
        &participants(&["p1:1", "p2:1", "p3:1", "p4:1", "p5:1"]),
        &resources(&["a", "b"]),
    );

    assert_eq!(decision.len(), 5, "Every participant appears in the decision");
    let idle = decision.iter().filter(|(_, rs)| rs.is_empty()).count();
    assert_eq!(idle, 3);
    assert_eq!(names(&decision, "p1:1"), vec!["a"]);
    assert_eq!(names(&decision, "p2:1"), vec!["b"]);
}

#[test]
fn test_duplicate_participants_are_collapsed() {
    let decision = RoundRobin.assign(
        &participants(&["p1:1", "p1:1", "p2:1"]),
        &resources(&["a", "b"]),
    );
    assert_eq!(decision.len(), 2);
    assert_eq!(decision.resource_count(), 2);
}

#[test]
fn test_custom_strategy() {
    let everything_to_first = StrategyFn::new("first", |ps: &[Participant], rs: &[Resource]| {
        let mut decision = Decision::new();
        let mut sorted = ps.to_vec();
        sorted.sort();
        if let Some(first) = sorted.first() {
            decision.insert(first.clone(), rs.to_vec());
        }
        decision
    });

    assert_eq!(everything_to_first.name(), "first");
    let decision = everything_to_first.assign(&participants(&["b:1", "a:1"]), &resources(&["x", "y"]));
    assert_eq!(names(&decision, "a:1"), vec!["x", "y"]);
    assert!(decision.resources_for("b:1").is_none());
}
