//! Node wiring
//!
//! A [`Node`] is one Keel process: a participant that registers itself,
//! serves decisions pushed to it and competes for leadership.

use axum::Router;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admin::{self, Admin};
use crate::config::KeelConfig;
use crate::coordinator::distributor::{Distributor, HttpParticipantClient, ParticipantClient};
use crate::coordinator::leader::{ElectionConfig, ElectionState, LeaderElection};
use crate::coordinator::membership::{Membership, Participant};
use crate::coordinator::registry::ResourceRegistry;
use crate::coordinator::strategy::{RoundRobin, Strategy};
use crate::error::Result;
use crate::runtime::ShutdownSignal;
use crate::store::{ensure_path, retry, CoordinationStore, RetryConfig, SessionState};
use crate::worker::{self, AssignmentReceiver, ConsumerRegistry, RegistryRenouncer};

/// Assembles a [`Node`]
pub struct NodeBuilder {
    config: KeelConfig,
    store: Arc<dyn CoordinationStore>,
    consumers: ConsumerRegistry,
    client: Option<Arc<dyn ParticipantClient>>,
    strategy: Arc<dyn Strategy>,
}

impl NodeBuilder {
    /// Start from a configuration and a connected store session
    pub fn new(config: KeelConfig, store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            config,
            store,
            consumers: ConsumerRegistry::new(),
            client: None,
            strategy: Arc::new(RoundRobin),
        }
    }

    /// Local pipeline consumers
    pub fn consumers(mut self, consumers: ConsumerRegistry) -> Self {
        self.consumers = consumers;
        self
    }

    /// Client used to reach other participants; HTTP by default
    pub fn client(mut self, client: Arc<dyn ParticipantClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Assignment strategy; [`RoundRobin`] by default
    pub fn strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Register with the cluster and start the background tasks
    pub async fn start(self) -> Result<Node> {
        let config = self.config;
        config.validate()?;
        let keys = config.key_space()?;
        let store = self.store;

        retry(&config.session_retry, "key space bootstrap", || {
            ensure_path(store.as_ref(), keys.root())
        })
        .await?;

        let participant = Participant::new(config.endpoint.clone(), config.weight)?;
        let membership = Arc::new(Membership::new(
            store.clone(),
            keys.clone(),
            config.session_retry.clone(),
        ));
        let registry = Arc::new(ResourceRegistry::new(store.clone(), keys.clone()));
        let client: Arc<dyn ParticipantClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpParticipantClient::new(config.client.clone())?),
        };
        let election = Arc::new(LeaderElection::new(
            store.clone(),
            keys,
            ElectionConfig {
                endpoint: participant.endpoint.clone(),
                retry: config.session_retry.clone(),
                rebalance_retry_delay: config.rebalance_retry_delay,
            },
            membership.clone(),
            registry.clone(),
            self.strategy,
            Arc::new(Distributor::new(client.clone())),
        ));
        let receiver = Arc::new(AssignmentReceiver::new(
            participant.endpoint.clone(),
            self.consumers,
            Arc::new(RegistryRenouncer::new(
                registry.clone(),
                participant.endpoint.clone(),
            )),
        ));

        registry.withdraw_renunciations(&participant.endpoint).await?;
        membership.register(&participant).await?;
        let (registered_tx, registered_rx) = watch::channel(store.session_state().session_id());
        let registered_tx = Arc::new(registered_tx);

        let shutdown = ShutdownSignal::new();
        let session_task = tokio::spawn(
            SessionWatcher {
                store: store.clone(),
                membership: membership.clone(),
                registry: registry.clone(),
                participant: participant.clone(),
                receiver: receiver.clone(),
                registered: registered_tx.clone(),
                retry: config.session_retry.clone(),
            }
            .run(shutdown.clone()),
        );
        let election_task = tokio::spawn(election.clone().run(registered_rx, shutdown.clone()));

        info!("Node {} started under {}", participant.endpoint, config.root);
        Ok(Node {
            participant,
            admin: Admin::new(membership.clone(), registry, election.clone(), client),
            membership,
            election,
            receiver,
            registered: registered_tx,
            shutdown,
            tasks: Mutex::new(vec![session_task, election_task]),
        })
    }
}

/// A running Keel process
pub struct Node {
    participant: Participant,
    membership: Arc<Membership>,
    election: Arc<LeaderElection>,
    receiver: Arc<AssignmentReceiver>,
    admin: Admin,
    registered: Arc<watch::Sender<Option<u64>>>,
    shutdown: ShutdownSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn endpoint(&self) -> &str {
        &self.participant.endpoint
    }

    pub fn admin(&self) -> &Admin {
        &self.admin
    }

    pub fn receiver(&self) -> &Arc<AssignmentReceiver> {
        &self.receiver
    }

    pub fn election(&self) -> &Arc<LeaderElection> {
        &self.election
    }

    /// True while this node runs a leader term
    pub fn is_leader(&self) -> bool {
        matches!(self.election.state(), ElectionState::Leader { .. })
    }

    /// Participant and admin routes for this node
    pub fn router(&self) -> Router {
        worker::router(self.receiver.clone()).merge(admin::router(self.admin.clone()))
    }

    /// Leave the cluster: deregister, resign, stop tasks, release resources
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            return Ok(());
        }
        info!("Node {} shutting down", self.participant.endpoint);

        let deregistered = self.membership.deregister(&self.participant.endpoint).await;
        self.registered.send_replace(None);
        let resigned = self.election.resign().await;
        self.shutdown.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.receiver.release_all().await;
        deregistered.and(resigned)
    }
}

/// Restores membership after session loss before election may resume
struct SessionWatcher {
    store: Arc<dyn CoordinationStore>,
    membership: Arc<Membership>,
    registry: Arc<ResourceRegistry>,
    participant: Participant,
    receiver: Arc<AssignmentReceiver>,
    registered: Arc<watch::Sender<Option<u64>>>,
    retry: RetryConfig,
}

impl SessionWatcher {
    async fn run(self, shutdown: ShutdownSignal) {
        let mut events = self.store.session_events();
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                changed = events.changed() => if changed.is_err() { return },
            }
            let state = *events.borrow_and_update();
            match state {
                SessionState::Connected { session_id } => {
                    if *self.registered.borrow() == Some(session_id) {
                        debug!("Reconnected to session {}", session_id);
                        continue;
                    }
                    warn!("Session replaced by {}, re-registering", session_id);
                    self.session_lost().await;
                    if !self.reregister(session_id, &shutdown).await {
                        return;
                    }
                }
                SessionState::Expired => self.session_lost().await,
                SessionState::Disconnected => debug!("Coordination store disconnected"),
            }
        }
    }

    async fn session_lost(&self) {
        if self.registered.send_replace(None).is_some() {
            warn!(
                "Session of {} lost, releasing local resources",
                self.participant.endpoint
            );
            self.receiver.release_all().await;
        }
    }

    /// Withdraw stale renunciations and retry registration until it succeeds,
    /// the session changes again or shutdown; returns false on shutdown
    async fn reregister(&self, session_id: u64, shutdown: &ShutdownSignal) -> bool {
        let mut attempt = 0u32;
        loop {
            if self.store.session_state().session_id() != Some(session_id) {
                return true;
            }
            let registered: Result<()> = async {
                self.registry
                    .withdraw_renunciations(&self.participant.endpoint)
                    .await?;
                self.membership.register(&self.participant).await
            }
            .await;
            match registered {
                Ok(()) => {
                    self.registered.send_replace(Some(session_id));
                    info!(
                        "{} re-registered under session {}",
                        self.participant.endpoint, session_id
                    );
                    return true;
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    error!("Re-registration failed ({}), retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = shutdown.wait() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
