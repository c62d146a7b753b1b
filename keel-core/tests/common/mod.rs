//! Shared fixtures for integration tests
//!
//! An in-process [`ParticipantClient`] that routes pushes straight to
//! registered [`AssignmentReceiver`]s, plus helpers to run small clusters on
//! a [`MemoryCluster`].

#![allow(dead_code)]

use async_trait::async_trait;
use keel_core::coordinator::{Participant, PushAck, Resource};
use keel_core::store::{MemoryCluster, MemorySession, RetryConfig};
use keel_core::worker::{ApplyOutcome, AssignmentReceiver, ConsumerRegistry, ResourceConsumer};
use keel_core::{KeelConfig, KeelError, Node, NodeBuilder};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const PLUGIN: &str = "mysql";

/// Routes decision pushes to in-process receivers
#[derive(Default)]
pub struct LocalClient {
    receivers: RwLock<HashMap<String, Arc<AssignmentReceiver>>>,
    unreachable: RwLock<BTreeSet<String>>,
}

impl LocalClient {
    pub fn attach(&self, receiver: Arc<AssignmentReceiver>) {
        self.receivers
            .write()
            .insert(receiver.endpoint().to_string(), receiver);
    }

    /// Make pushes to `endpoint` fail until [`heal`](Self::heal)
    pub fn partition(&self, endpoint: &str) {
        self.unreachable.write().insert(endpoint.to_string());
    }

    pub fn heal(&self, endpoint: &str) {
        self.unreachable.write().remove(endpoint);
    }

    fn receiver(&self, participant: &Participant) -> keel_core::Result<Arc<AssignmentReceiver>> {
        let unreachable = |reason: &str| KeelError::RpcFailed {
            endpoint: participant.endpoint.clone(),
            reason: reason.into(),
        };
        if self.unreachable.read().contains(&participant.endpoint) {
            return Err(unreachable("partitioned"));
        }
        self.receivers
            .read()
            .get(&participant.endpoint)
            .cloned()
            .ok_or_else(|| unreachable("connection refused"))
    }
}

#[async_trait]
impl keel_core::coordinator::ParticipantClient for LocalClient {
    async fn push(
        &self,
        participant: &Participant,
        epoch: i64,
        resources: &[Resource],
    ) -> keel_core::Result<PushAck> {
        let receiver = self.receiver(participant)?;
        match receiver.apply(epoch, resources.to_vec()).await? {
            ApplyOutcome::Accepted { .. } => Ok(PushAck::Accepted),
            ApplyOutcome::Rejected { held_epoch } => Ok(PushAck::LeaderMoved { held_epoch }),
        }
    }

    async fn call(
        &self,
        participant: &Participant,
        method: &str,
        _query: &str,
    ) -> keel_core::Result<String> {
        let receiver = self.receiver(participant)?;
        Ok(format!("{} {} epoch={}", participant.endpoint, method, receiver.held_epoch().await))
    }
}

/// Consumer recording the last working set it was fed
#[derive(Default)]
pub struct Recorder {
    current: Mutex<Vec<String>>,
    feeds: Mutex<usize>,
}

impl Recorder {
    pub fn current(&self) -> Vec<String> {
        self.current.lock().clone()
    }

    pub fn feeds(&self) -> usize {
        *self.feeds.lock()
    }
}

#[async_trait]
impl ResourceConsumer for Recorder {
    async fn feed_resources(&self, resources: Vec<Resource>) -> keel_core::Result<()> {
        *self.current.lock() = resources.into_iter().map(|r| r.name).collect();
        *self.feeds.lock() += 1;
        Ok(())
    }
}

/// A node under test with its store session and consumer
pub struct TestNode {
    pub node: Node,
    pub session: Arc<MemorySession>,
    pub recorder: Arc<Recorder>,
}

pub fn config(endpoint: &str) -> KeelConfig {
    KeelConfig {
        endpoint: endpoint.into(),
        bind_addr: "127.0.0.1:0".into(),
        session_retry: RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
        },
        rebalance_retry_delay: Duration::from_millis(50),
        ..KeelConfig::default()
    }
}

pub async fn start_node(
    cluster: &MemoryCluster,
    client: &Arc<LocalClient>,
    endpoint: &str,
) -> TestNode {
    let session = cluster.connect();
    let recorder = Arc::new(Recorder::default());
    let mut consumers = ConsumerRegistry::new();
    consumers.register(PLUGIN, recorder.clone());

    let node = NodeBuilder::new(config(endpoint), session.clone())
        .consumers(consumers)
        .client(client.clone())
        .start()
        .await
        .unwrap();
    client.attach(node.receiver().clone());

    TestNode {
        node,
        session,
        recorder,
    }
}

pub fn resource(name: &str) -> Resource {
    Resource::new(PLUGIN, name)
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
