//! Stress tests for rebalancing under load
//!
//! Run with: cargo test --release --test stress_rebalance -- --nocapture

mod common;

use common::*;
use keel_core::coordinator::{Participant, Resource, RoundRobin, Strategy};
use keel_core::store::MemoryCluster;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Strategy throughput on a large fleet
#[test]
fn stress_round_robin_assignment() {
    let participants: Vec<Participant> = (0..1000)
        .map(|i| Participant::new(format!("worker-{:04}:7070", i), 1).unwrap())
        .collect();
    let resources: Vec<Resource> = (0..50_000)
        .map(|i| Resource::new("mysql", format!("mysql://db-{:05}:3306", i)))
        .collect();

    let start = Instant::now();
    let iterations = 20;
    let mut last = None;
    for _ in 0..iterations {
        last = Some(RoundRobin.assign(&participants, &resources));
    }
    let elapsed = start.elapsed();
    let decision = last.unwrap();

    println!("Round-robin stress test:");
    println!("  Participants: {}", participants.len());
    println!("  Resources: {}", resources.len());
    println!("  Avg assignment time: {:?}", elapsed / iterations);

    assert_eq!(decision.resource_count(), resources.len());
    assert!(decision.is_exclusive());
    let sizes: BTreeSet<usize> = decision.iter().map(|(_, rs)| rs.len()).collect();
    assert_eq!(sizes, BTreeSet::from([50]), "Blocks should be balanced");
}

/// Concurrent registrations converge to an exclusive, complete assignment
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_cluster_convergence() {
    let num_nodes = 8;
    let num_resources = 200;

    let cluster = MemoryCluster::new();
    let client = Arc::new(LocalClient::default());
    let mut nodes = Vec::new();
    for i in 0..num_nodes {
        nodes.push(start_node(&cluster, &client, &format!("node-{}:7000", i)).await);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for chunk in 0..num_nodes {
        let admin = nodes[chunk].node.admin().clone();
        handles.push(tokio::spawn(async move {
            for i in (chunk..num_resources).step_by(num_nodes) {
                admin
                    .register_resource(&resource(&format!("db-{:03}", i)))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    eventually("every resource to be served once", || async {
        let mut served: Vec<String> = nodes.iter().flat_map(|n| n.recorder.current()).collect();
        let total = served.len();
        served.sort();
        served.dedup();
        total == num_resources
            && served.len() == num_resources
            && nodes
                .iter()
                .all(|n| n.recorder.current().len() == num_resources / num_nodes)
    })
    .await;
    let elapsed = start.elapsed();

    let leaders = nodes.iter().filter(|n| n.node.is_leader()).count();
    let feeds: usize = nodes.iter().map(|n| n.recorder.feeds()).sum();

    println!("Cluster convergence stress test:");
    println!("  Nodes: {}", num_nodes);
    println!("  Resources: {}", num_resources);
    println!("  Converged in: {:?}", elapsed);
    println!("  Consumer feeds: {}", feeds);

    assert_eq!(leaders, 1, "Exactly one leader");

    for node in &nodes {
        node.node.shutdown().await.unwrap();
    }
}
