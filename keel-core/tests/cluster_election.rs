//! End-to-end tests for election, rebalancing and failover
//!
//! Nodes share a [`MemoryCluster`] and reach each other through an
//! in-process client, so every path except HTTP is exercised.

mod common;

use common::*;
use keel_core::coordinator::{Distributor, ElectionState, KeySpace, Membership, ResourceRegistry};
use keel_core::worker::ApplyOutcome;
use keel_core::KeelError;
use std::collections::BTreeSet;
use std::sync::Arc;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn leader_epoch(node: &TestNode) -> Option<i64> {
    match node.node.election().state() {
        ElectionState::Leader { epoch } => Some(epoch),
        _ => None,
    }
}

async fn register_all(node: &TestNode, list: &[&str]) {
    for name in list {
        node.node.admin().register_resource(&resource(name)).await.unwrap();
    }
}

#[tokio::test]
async fn test_two_participants_split_five_resources() {
    let cluster = keel_core::store::MemoryCluster::new();
    let client = Arc::new(LocalClient::default());
    let p1 = start_node(&cluster, &client, "p1:7001").await;
    let p2 = start_node(&cluster, &client, "p2:7002").await;

    eventually("a leader", || async { p1.node.is_leader() || p2.node.is_leader() }).await;
    register_all(&p1, &["a", "b", "c", "d", "e"]).await;

    eventually("the split", || async {
        p1.recorder.current() == names(&["a", "b", "c"]) && p2.recorder.current() == names(&["d", "e"])
    })
    .await;

    let (leader, follower) = if p1.node.is_leader() { (&p1, &p2) } else { (&p2, &p1) };
    assert_eq!(leader_epoch(leader), Some(1));
    assert_eq!(
        follower.node.admin().leader().await.unwrap().as_deref(),
        Some(leader.node.endpoint())
    );

    let view = leader.node.admin().current_decision().unwrap();
    assert_eq!(view.leader_epoch, 1);
    assert_eq!(view.assignments.len(), 2);
    assert!(follower.node.admin().current_decision().is_none());
    assert!(matches!(
        follower.node.admin().rebalance().await,
        Err(KeelError::NotLeader)
    ));
    assert!(leader.node.admin().orphaned_resources().await.unwrap().is_empty());

    p1.node.shutdown().await.unwrap();
    p2.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failover_fences_the_old_leader() {
    let cluster = keel_core::store::MemoryCluster::new();
    let client = Arc::new(LocalClient::default());
    let p1 = start_node(&cluster, &client, "p1:7001").await;
    eventually("p1 to lead", || async { p1.node.is_leader() }).await;
    let p2 = start_node(&cluster, &client, "p2:7002").await;
    register_all(&p1, &["a", "b", "c", "d", "e"]).await;

    eventually("the split", || async { p2.recorder.current() == names(&["d", "e"]) }).await;
    assert_eq!(leader_epoch(&p1), Some(1));

    p1.session.close();

    eventually("p2 to lead at epoch 2", || async { leader_epoch(&p2) == Some(2) }).await;
    eventually("p2 to take everything", || async {
        p2.recorder.current() == names(&["a", "b", "c", "d", "e"])
    })
    .await;
    assert_eq!(p2.node.receiver().held_epoch().await, 2);
    eventually("the old owner to be told to stop", || async {
        p1.recorder.current().is_empty() && p1.node.receiver().held_epoch().await == 2
    })
    .await;

    // A push still in flight from the deposed leader
    let stale = p2.node.receiver().apply(1, vec![resource("a")]).await.unwrap();
    assert_eq!(stale, ApplyOutcome::Rejected { held_epoch: 2 });
    assert_eq!(p2.recorder.current(), names(&["a", "b", "c", "d", "e"]));

    let old_term = Distributor::new(client.clone());
    let decision = p2.node.election().current_term().unwrap().last_decision().await.unwrap();
    let report = old_term.distribute(1, &decision, &BTreeSet::new()).await;
    assert_eq!(report.newer_epoch(), Some(2));
    assert!(report.accepted.is_empty());

    let _ = p1.node.shutdown().await;
    p2.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_departed_participant_gets_empty_push() {
    let cluster = keel_core::store::MemoryCluster::new();
    let client = Arc::new(LocalClient::default());
    let p1 = start_node(&cluster, &client, "p1:7001").await;
    eventually("p1 to lead", || async { p1.node.is_leader() }).await;
    let p2 = start_node(&cluster, &client, "p2:7002").await;
    register_all(&p1, &["a", "b", "c", "d", "e"]).await;
    eventually("the split", || async { p2.recorder.current() == names(&["d", "e"]) }).await;
    let fed = p2.recorder.feeds();

    // p2 leaves the fleet but its RPC endpoint stays reachable
    let keys = KeySpace::new("/keel").unwrap();
    Membership::new(p2.session.clone(), keys, config("p2:7002").session_retry)
        .deregister("p2:7002")
        .await
        .unwrap();

    eventually("p1 to take everything", || async {
        p1.recorder.current() == names(&["a", "b", "c", "d", "e"])
    })
    .await;
    eventually("p2 to be emptied", || async {
        p2.recorder.current().is_empty() && p2.recorder.feeds() > fed
    })
    .await;
    assert!(p2.node.receiver().owned().await.is_empty());
    assert_eq!(p2.node.receiver().held_epoch().await, 1);
    assert!(p1.node.is_leader());

    p1.node.shutdown().await.unwrap();
    let _ = p2.node.shutdown().await;
}

#[tokio::test]
async fn test_restarted_participant_withdraws_old_renunciation() {
    let cluster = keel_core::store::MemoryCluster::new();
    let client = Arc::new(LocalClient::default());

    // Left behind by an earlier life of p1
    let registry = ResourceRegistry::new(cluster.connect(), KeySpace::new("/keel").unwrap());
    registry.register_resource(&resource("a")).await.unwrap();
    registry.renounce_resources("p1:7001", &[resource("a")]).await.unwrap();

    let p1 = start_node(&cluster, &client, "p1:7001").await;
    let (state, _) = registry.resource_state("a").await.unwrap();
    assert!(state.renounced_by.is_empty());

    eventually("p1 to serve a", || async { p1.recorder.current() == names(&["a"]) }).await;
    eventually("a to be owned", || async {
        matches!(registry.resource_state("a").await, Ok((state, _)) if state.owner == "p1:7001")
    })
    .await;

    p1.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resource_renounced_by_everyone_is_orphaned() {
    let cluster = keel_core::store::MemoryCluster::new();
    let client = Arc::new(LocalClient::default());
    let p1 = start_node(&cluster, &client, "p1:7001").await;
    let p2 = start_node(&cluster, &client, "p2:7002").await;
    eventually("a leader", || async { p1.node.is_leader() || p2.node.is_leader() }).await;

    register_all(&p1, &["a", "b"]).await;
    p1.node
        .admin()
        .register_resource(&keel_core::coordinator::Resource::new("oracle", "legacy"))
        .await
        .unwrap();

    let registry = ResourceRegistry::new(cluster.connect(), KeySpace::new("/keel").unwrap());
    eventually("both participants to renounce", || async {
        match registry.resource_state("legacy").await {
            Ok((state, _)) => state.renounced_by.len() == 2 && state.is_orphan(),
            Err(_) => false,
        }
    })
    .await;

    let orphaned = p1.node.admin().orphaned_resources().await.unwrap();
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].name, "legacy");

    let leader = if p1.node.is_leader() { &p1 } else { &p2 };
    eventually("legacy out of the decision", || async {
        leader
            .node
            .admin()
            .current_decision()
            .map(|view| {
                view.assignments
                    .iter()
                    .all(|a| a.resources.iter().all(|r| r.name != "legacy"))
            })
            .unwrap_or(false)
    })
    .await;
    let mut served: Vec<String> = p1.recorder.current();
    served.extend(p2.recorder.current());
    served.sort();
    assert_eq!(served, names(&["a", "b"]));

    p1.node.shutdown().await.unwrap();
    p2.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expired_participant_rejoins() {
    let cluster = keel_core::store::MemoryCluster::new();
    let client = Arc::new(LocalClient::default());
    let p1 = start_node(&cluster, &client, "p1:7001").await;
    eventually("p1 to lead", || async { p1.node.is_leader() }).await;
    let p2 = start_node(&cluster, &client, "p2:7002").await;
    register_all(&p1, &["a", "b", "c", "d"]).await;
    eventually("the split", || async { p2.recorder.current() == names(&["c", "d"]) }).await;

    p2.session.expire();

    eventually("p2 to re-register", || async {
        p1.node.admin().live_participants().await.map(|ps| ps.len() == 2).unwrap_or(false)
            && p2.recorder.current() == names(&["c", "d"])
    })
    .await;
    assert!(p1.node.is_leader(), "Follower expiry must not move leadership");
    assert!(p2.recorder.feeds() >= 3, "p2 released and was re-fed");

    p1.node.shutdown().await.unwrap();
    p2.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_participant_is_retried() {
    let cluster = keel_core::store::MemoryCluster::new();
    let client = Arc::new(LocalClient::default());
    let p1 = start_node(&cluster, &client, "p1:7001").await;
    eventually("p1 to lead", || async { p1.node.is_leader() }).await;
    let p2 = start_node(&cluster, &client, "p2:7002").await;
    eventually("two members", || async {
        p1.node.admin().live_participants().await.map(|ps| ps.len() == 2).unwrap_or(false)
    })
    .await;

    client.partition("p2:7002");
    register_all(&p1, &["a", "b"]).await;
    eventually("p1 to be fed", || async { p1.recorder.current() == names(&["a"]) }).await;
    assert!(p2.recorder.current().is_empty());

    client.heal("p2:7002");
    eventually("the retry to reach p2", || async { p2.recorder.current() == names(&["b"]) }).await;

    p1.node.shutdown().await.unwrap();
    p2.node.shutdown().await.unwrap();
}
