//! Leader election and controller terms
//!
//! Every participant runs the election loop. The winner holds the ephemeral
//! leader node, advances the leader epoch and runs a controller term: a fresh
//! [`Rebalancer`] fed by watch loops on membership, resources and
//! renunciations. The term ends when the leader node disappears, the session
//! is lost or the process shuts down.

use bytes::Bytes;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::distributor::Distributor;
use super::epoch::LeaderEpoch;
use super::keys::KeySpace;
use super::membership::Membership;
use super::rebalancer::{
    trigger_queue, DecisionSlot, RebalanceTrigger, Rebalancer, TriggerSender,
};
use super::registry::ResourceRegistry;
use super::strategy::Strategy;
use crate::error::{KeelError, Result};
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;
use crate::store::{
    delete_if_present, ensure_path, CoordinationStore, CreateMode, RetryConfig, Watch, WatchEvent,
};

/// Configuration for the election loop
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Endpoint written into the leader node
    pub endpoint: String,
    /// Backoff for store failures
    pub retry: RetryConfig,
    /// Delay before retrying a failed or skipped rebalance
    pub rebalance_retry_delay: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            retry: RetryConfig::default(),
            rebalance_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Election state of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Another participant leads, or the loop is idle
    Follower,
    /// Attempting to take the leader node
    Electing,
    /// Leading under `epoch`
    Leader { epoch: i64 },
}

enum Attempt {
    Won,
    Lost(Watch),
    Retry,
}

/// Election loop and controller-term owner
pub struct LeaderElection {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    config: ElectionConfig,
    membership: Arc<Membership>,
    registry: Arc<ResourceRegistry>,
    strategy: Arc<dyn Strategy>,
    distributor: Arc<Distributor>,
    epoch: LeaderEpoch,
    state: watch::Sender<ElectionState>,
    term: RwLock<Option<Arc<Rebalancer>>>,
    published: DecisionSlot,
}

impl LeaderElection {
    /// Create the election handle; nothing runs until [`run`](Self::run)
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeySpace,
        config: ElectionConfig,
        membership: Arc<Membership>,
        registry: Arc<ResourceRegistry>,
        strategy: Arc<dyn Strategy>,
        distributor: Arc<Distributor>,
    ) -> Self {
        let (state, _) = watch::channel(ElectionState::Follower);
        Self {
            epoch: LeaderEpoch::new(store.clone(), keys.clone()),
            store,
            keys,
            config,
            membership,
            registry,
            strategy,
            distributor,
            state,
            term: RwLock::new(None),
            published: DecisionSlot::default(),
        }
    }

    /// Current election state
    pub fn state(&self) -> ElectionState {
        *self.state.borrow()
    }

    /// Subscribe to election state changes
    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.state.subscribe()
    }

    /// Rebalancer of the running term, if this process leads
    pub fn current_term(&self) -> Option<Arc<Rebalancer>> {
        self.term.read().clone()
    }

    /// Decision published by the running term
    pub fn published(&self) -> DecisionSlot {
        self.published.clone()
    }

    /// Endpoint stored in the leader node, if any
    pub async fn current_leader(&self) -> Result<Option<String>> {
        match self.store.get(&self.keys.leader()).await {
            Ok((data, _)) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Err(KeelError::NoNode { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete the leader node if this session holds it
    pub async fn resign(&self) -> Result<()> {
        let path = self.keys.leader();
        let current = self.store.session_state().session_id();
        match self.store.exists(&path).await? {
            Some(stat) if current.is_some() && stat.ephemeral_owner == current => {
                match self.store.delete(&path, Some(stat.version)).await {
                    Ok(()) | Err(KeelError::NoNode { .. }) | Err(KeelError::BadVersion { .. }) => {
                        info!("{} resigned leadership", self.config.endpoint);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Ok(()),
        }
    }

    /// Run the election until `shutdown` fires.
    ///
    /// `registered` carries the session id membership was last registered
    /// under; the loop only competes while it matches the live session.
    pub async fn run(
        self: Arc<Self>,
        mut registered: watch::Receiver<Option<u64>>,
        shutdown: ShutdownSignal,
    ) {
        let mut failures = 0u32;
        loop {
            if shutdown.is_shutdown() || !self.wait_registered(&mut registered, &shutdown).await {
                break;
            }

            self.state.send_replace(ElectionState::Electing);
            let failed = match self.try_acquire().await {
                Ok(Attempt::Won) => match self.lead(&shutdown).await {
                    Ok(()) => {
                        failures = 0;
                        self.state.send_replace(ElectionState::Follower);
                        None
                    }
                    Err(e) => Some(format!("leader term ended with error: {}", e)),
                },
                Ok(Attempt::Lost(watch)) => {
                    failures = 0;
                    self.state.send_replace(ElectionState::Follower);
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        event = watch => debug!("Leader node changed: {:?}", event),
                    }
                    None
                }
                Ok(Attempt::Retry) => None,
                Err(e) => Some(format!("election attempt failed: {}", e)),
            };

            if let Some(reason) = failed {
                let delay = self.config.retry.delay_for(failures);
                failures = failures.saturating_add(1);
                warn!("{} ({}), retrying in {:?}", self.config.endpoint, reason, delay);
                self.state.send_replace(ElectionState::Follower);
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        self.state.send_replace(ElectionState::Follower);
        debug!("Election loop for {} stopped", self.config.endpoint);
    }

    async fn wait_registered(
        &self,
        registered: &mut watch::Receiver<Option<u64>>,
        shutdown: &ShutdownSignal,
    ) -> bool {
        let mut session = self.store.session_events();
        loop {
            let current = session.borrow_and_update().session_id();
            if current.is_some() && *registered.borrow_and_update() == current {
                return true;
            }
            tokio::select! {
                _ = shutdown.wait() => return false,
                changed = registered.changed() => if changed.is_err() { return false },
                changed = session.changed() => if changed.is_err() { return false },
            }
        }
    }

    async fn try_acquire(&self) -> Result<Attempt> {
        let path = self.keys.leader();
        let payload = Bytes::from(self.config.endpoint.clone());
        match self.store.create(&path, payload, CreateMode::Ephemeral).await {
            Ok(()) => return Ok(Attempt::Won),
            Err(KeelError::NodeExists { .. }) => {}
            Err(KeelError::NoNode { .. }) => {
                ensure_path(self.store.as_ref(), self.keys.root()).await?;
                return Ok(Attempt::Retry);
            }
            Err(e) => return Err(e),
        }

        let current = self.store.session_state().session_id();
        let (existing, watch) = self.store.watch_exists(&path).await?;
        match existing {
            None => Ok(Attempt::Retry),
            Some((_, stat)) if current.is_some() && stat.ephemeral_owner == current => {
                debug!("Leader node already held by this session");
                Ok(Attempt::Won)
            }
            Some((data, _)) => {
                debug!("Following leader {}", String::from_utf8_lossy(&data));
                Ok(Attempt::Lost(watch))
            }
        }
    }

    async fn lead(&self, shutdown: &ShutdownSignal) -> Result<()> {
        let epoch = match self.epoch.advance().await {
            Ok(epoch) => epoch,
            Err(e) => {
                warn!("Could not advance leader epoch, giving up leadership: {}", e);
                let _ = delete_if_present(self.store.as_ref(), &self.keys.leader()).await;
                return Err(e);
            }
        };
        standard::LEADER_EPOCH.set(epoch);
        self.state.send_replace(ElectionState::Leader { epoch });
        info!("{} became leader at epoch {}", self.config.endpoint, epoch);

        let term_signal = ShutdownSignal::new();
        let rebalancer = Arc::new(Rebalancer::new(
            self.store.clone(),
            self.membership.clone(),
            self.registry.clone(),
            self.strategy.clone(),
            self.distributor.clone(),
            epoch,
            self.config.rebalance_retry_delay,
            self.published.clone(),
        ));
        *self.term.write() = Some(rebalancer.clone());

        let (queue, triggers) = trigger_queue();
        let tasks = self.spawn_term_tasks(rebalancer, triggers, queue.clone(), &term_signal);
        queue.send(RebalanceTrigger::BecameLeader);

        let result = self.hold_leadership(shutdown).await;

        term_signal.shutdown();
        for task in tasks {
            let _ = task.await;
        }
        *self.term.write() = None;
        *self.published.write() = None;
        info!("{} leader term at epoch {} ended", self.config.endpoint, epoch);
        result
    }

    fn spawn_term_tasks(
        &self,
        rebalancer: Arc<Rebalancer>,
        triggers: super::rebalancer::TriggerReceiver,
        queue: TriggerSender,
        term: &ShutdownSignal,
    ) -> Vec<JoinHandle<()>> {
        let retry = self.config.retry.clone();
        let membership = self.membership.clone();
        let resources = self.registry.clone();
        let renunciations = self.registry.clone();

        vec![
            tokio::spawn(rebalancer.run(triggers, queue.clone(), term.clone())),
            tokio::spawn(watch_loop(
                RebalanceTrigger::MembershipChanged,
                queue.clone(),
                term.clone(),
                retry.clone(),
                move || {
                    let membership = membership.clone();
                    async move { membership.watch().await.map(|(_, watch)| watch) }
                },
            )),
            tokio::spawn(watch_loop(
                RebalanceTrigger::ResourcesChanged,
                queue.clone(),
                term.clone(),
                retry.clone(),
                move || {
                    let registry = resources.clone();
                    async move { registry.watch().await.map(|(_, watch)| watch) }
                },
            )),
            tokio::spawn(watch_loop(
                RebalanceTrigger::Renounced,
                queue,
                term.clone(),
                retry,
                move || {
                    let registry = renunciations.clone();
                    async move { registry.watch_renunciations().await }
                },
            )),
        ]
    }

    /// Block until the leader node is gone, the session is lost or shutdown
    async fn hold_leadership(&self, shutdown: &ShutdownSignal) -> Result<()> {
        let path = self.keys.leader();
        loop {
            let current = self.store.session_state().session_id();
            let watch = match self.store.watch_exists(&path).await {
                Ok((Some((_, stat)), watch))
                    if current.is_some() && stat.ephemeral_owner == current =>
                {
                    watch
                }
                Ok(_) => {
                    warn!("Leader node no longer held by this session");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    // Ephemeral node survives a disconnect; keep leading until told otherwise.
                    tokio::select! {
                        _ = shutdown.wait() => return Ok(()),
                        _ = tokio::time::sleep(self.config.retry.max_delay) => continue,
                    }
                }
                Err(e) => return Err(e),
            };

            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                event = watch => match event {
                    Ok(WatchEvent::DataChanged) => continue,
                    Ok(event) => {
                        info!("Leadership lost: {:?}", event);
                        return Ok(());
                    }
                    Err(_) => return Ok(()),
                },
            }
        }
    }
}

/// Keep a one-shot watch armed and turn each firing into a trigger.
///
/// The next watch is armed before the trigger is enqueued, so no change
/// between firing and re-arming goes unnoticed.
async fn watch_loop<F, Fut>(
    trigger: RebalanceTrigger,
    queue: TriggerSender,
    term: ShutdownSignal,
    retry: RetryConfig,
    arm: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Watch>>,
{
    let mut pending = false;
    let mut failures = 0u32;
    loop {
        let watch = match arm().await {
            Ok(watch) => watch,
            Err(e) => {
                let delay = retry.delay_for(failures);
                failures = failures.saturating_add(1);
                debug!("Arming {:?} watch failed ({}), retrying in {:?}", trigger, e, delay);
                tokio::select! {
                    _ = term.wait() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };
        failures = 0;
        if pending && !queue.send(trigger) {
            return;
        }
        pending = false;

        tokio::select! {
            _ = term.wait() => return,
            event = watch => match event {
                Ok(WatchEvent::SessionLost) | Err(_) => return,
                Ok(event) => {
                    debug!("{:?} watch fired: {:?}", trigger, event);
                    pending = true;
                }
            },
        }
    }
}
