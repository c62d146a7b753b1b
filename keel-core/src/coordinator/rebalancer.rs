//! Rebalancer
//!
//! Recomputes the assignment whenever membership, the resource inventory or a
//! renunciation changes, distributes it and records ownership. One rebalancer
//! lives for exactly one leader term.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::decision::Decision;
use super::distributor::{DistributionReport, Distributor};
use super::membership::{Membership, Participant};
use super::registry::{Resource, ResourceRegistry, ResourceState};
use super::strategy::Strategy;
use crate::error::{KeelError, Result};
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;
use crate::store::CoordinationStore;

/// Why a rebalance was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceTrigger {
    /// This process just won the election
    BecameLeader,
    /// A participant joined or left
    MembershipChanged,
    /// A resource was registered or unregistered
    ResourcesChanged,
    /// A participant handed resources back
    Renounced,
    /// Operator request or retry after a failed distribution
    Forced,
}

/// Result of one rebalance run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceOutcome {
    /// Store connection is down; nothing was read or written
    Disconnected,
    /// No live participant to assign to
    NoParticipants,
    /// Nothing registered to assign
    NoResources,
    /// Computed decision equals the last distributed one
    Unchanged,
    /// A participant reported a newer leader; states were left untouched
    Superseded { held_epoch: i64 },
    /// A new decision was distributed and recorded
    Applied {
        participants: usize,
        resources: usize,
        report: DistributionReport,
    },
}

/// Decision snapshot readable while a rebalance is in flight
#[derive(Debug, Clone)]
pub struct PublishedDecision {
    pub leader_epoch: i64,
    pub decision: Decision,
    pub computed_at: DateTime<Utc>,
}

/// Shared slot holding the most recently published decision
pub type DecisionSlot = Arc<RwLock<Option<PublishedDecision>>>;

/// Sending half of a term's trigger queue
#[derive(Clone)]
pub struct TriggerSender {
    inner: mpsc::UnboundedSender<RebalanceTrigger>,
}

impl TriggerSender {
    /// Enqueue a trigger; false once the consumer is gone
    pub fn send(&self, trigger: RebalanceTrigger) -> bool {
        self.inner.send(trigger).is_ok()
    }
}

/// Receiving half of a term's trigger queue
pub type TriggerReceiver = mpsc::UnboundedReceiver<RebalanceTrigger>;

/// Create the single-consumer trigger queue for one term
pub fn trigger_queue() -> (TriggerSender, TriggerReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TriggerSender { inner: tx }, rx)
}

/// Last distributed decision and the member sessions it was pushed to
struct Applied {
    decision: Decision,
    sessions: BTreeMap<String, Option<u64>>,
}

/// Leader-side assignment loop
pub struct Rebalancer {
    store: Arc<dyn CoordinationStore>,
    membership: Arc<Membership>,
    registry: Arc<ResourceRegistry>,
    strategy: Arc<dyn Strategy>,
    distributor: Arc<Distributor>,
    leader_epoch: i64,
    retry_delay: Duration,
    last_applied: Mutex<Option<Applied>>,
    published: DecisionSlot,
    capacity_warned: AtomicBool,
}

impl Rebalancer {
    /// Create a rebalancer for the term holding `leader_epoch`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        membership: Arc<Membership>,
        registry: Arc<ResourceRegistry>,
        strategy: Arc<dyn Strategy>,
        distributor: Arc<Distributor>,
        leader_epoch: i64,
        retry_delay: Duration,
        published: DecisionSlot,
    ) -> Self {
        Self {
            store,
            membership,
            registry,
            strategy,
            distributor,
            leader_epoch,
            retry_delay,
            last_applied: Mutex::new(None),
            published,
            capacity_warned: AtomicBool::new(false),
        }
    }

    /// Epoch this rebalancer distributes under
    pub fn leader_epoch(&self) -> i64 {
        self.leader_epoch
    }

    /// Last decision this term distributed
    pub async fn last_decision(&self) -> Option<Decision> {
        self.last_applied
            .lock()
            .await
            .as_ref()
            .map(|applied| applied.decision.clone())
    }

    /// Run one rebalance. Runs never overlap.
    pub async fn rebalance(&self, trigger: RebalanceTrigger) -> Result<RebalanceOutcome> {
        let mut last = self.last_applied.lock().await;
        let _timer = standard::REBALANCE_DURATION.start_timer();

        if !self.store.is_connected() {
            debug!("Skipping rebalance ({:?}): store disconnected", trigger);
            return Ok(RebalanceOutcome::Disconnected);
        }

        let registrations = self.membership.live_registrations().await?;
        let sessions: BTreeMap<String, Option<u64>> = registrations
            .iter()
            .map(|(p, session)| (p.endpoint.clone(), *session))
            .collect();
        let participants: Vec<Participant> = registrations.into_iter().map(|(p, _)| p).collect();
        standard::LIVE_PARTICIPANTS.set(participants.len() as i64);
        if participants.is_empty() {
            self.no_capacity("no live participants");
            *last = None;
            *self.published.write() = None;
            self.orphan_all().await?;
            return Ok(RebalanceOutcome::NoParticipants);
        }

        let states = self.registry.resource_states().await?;
        if states.is_empty() {
            self.no_capacity("no registered resources");
            standard::ORPHAN_RESOURCES.set(0);
            return Ok(RebalanceOutcome::NoResources);
        }
        let resources: Vec<Resource> = states.iter().map(|(r, _)| r.clone()).collect();

        let mut decision = self.strategy.assign(&participants, &resources);
        if !decision.is_exclusive() {
            return Err(KeelError::Internal {
                message: format!(
                    "strategy {} assigned a resource to more than one participant",
                    self.strategy.name()
                ),
            });
        }
        if !decision.is_canonical() {
            warn!(
                "Strategy {} returned unsorted assignments; decisions may differ spuriously",
                self.strategy.name()
            );
        }
        let moved = apply_renunciations(&mut decision, &states);
        self.capacity_warned.store(false, Ordering::Relaxed);

        if trigger != RebalanceTrigger::Forced
            && last
                .as_ref()
                .is_some_and(|prev| prev.decision.equals(&decision) && prev.sessions == sessions)
        {
            debug!("Rebalance ({:?}): decision unchanged", trigger);
            return Ok(RebalanceOutcome::Unchanged);
        }

        info!(
            "Rebalancing ({:?}) at epoch {}: {} resources over {} participants, \
             {} moved off renouncers",
            trigger,
            self.leader_epoch,
            decision.resource_count(),
            decision.len(),
            moved
        );

        let mut previously: BTreeSet<String> = last
            .iter()
            .flat_map(|prev| prev.decision.participants().map(|p| p.endpoint.clone()))
            .collect();
        previously.extend(
            states
                .iter()
                .filter(|(_, s)| !s.owner.is_empty())
                .map(|(_, s)| s.owner.clone()),
        );

        *self.published.write() = Some(PublishedDecision {
            leader_epoch: self.leader_epoch,
            decision: decision.clone(),
            computed_at: Utc::now(),
        });
        *last = Some(Applied {
            decision: decision.clone(),
            sessions,
        });

        let report = self
            .distributor
            .distribute(self.leader_epoch, &decision, &previously)
            .await;
        if let Some(held_epoch) = report.newer_epoch().filter(|e| *e > self.leader_epoch) {
            warn!(
                "Epoch {} superseded by {}; not recording ownership",
                self.leader_epoch, held_epoch
            );
            *last = None;
            return Ok(RebalanceOutcome::Superseded { held_epoch });
        }
        if !report.failed.is_empty() {
            // Forget the decision so the retry pushes it again.
            *last = None;
        }

        self.record_ownership(&decision, &states, &participants).await?;
        standard::REBALANCES.inc();

        Ok(RebalanceOutcome::Applied {
            participants: decision.len(),
            resources: decision.resource_count(),
            report,
        })
    }

    async fn record_ownership(
        &self,
        decision: &Decision,
        states: &[(Resource, ResourceState)],
        participants: &[Participant],
    ) -> Result<()> {
        let live: BTreeSet<&str> = participants.iter().map(|p| p.endpoint.as_str()).collect();
        let owners = decision.owner_index();
        let mut orphans = 0i64;

        for (resource, _) in states {
            let owner = owners.get(resource.name.as_str()).map(|p| p.endpoint.clone());
            if owner.is_none() {
                orphans += 1;
            }
            let result = self
                .registry
                .update_state(&resource.name, |state| {
                    let changed = match &owner {
                        Some(owner) => state.assign(owner, self.leader_epoch),
                        None => state.become_orphan(),
                    };
                    let before = state.renounced_by.len();
                    state.renounced_by.retain(|e| live.contains(e.as_str()));
                    changed || state.renounced_by.len() != before
                })
                .await;
            match result {
                Ok(_) => {}
                Err(KeelError::NoNode { .. }) => {
                    debug!("Resource {} unregistered during rebalance", resource.name)
                }
                Err(e) => return Err(e),
            }
        }

        standard::ORPHAN_RESOURCES.set(orphans);
        Ok(())
    }

    /// Nobody is live: every resource loses its owner and stale renunciations
    async fn orphan_all(&self) -> Result<()> {
        let states = self.registry.resource_states().await?;
        for (resource, _) in &states {
            let result = self
                .registry
                .update_state(&resource.name, |state| {
                    let orphaned = state.become_orphan();
                    let pruned = !state.renounced_by.is_empty();
                    state.renounced_by.clear();
                    orphaned || pruned
                })
                .await;
            match result {
                Ok(_) => {}
                Err(KeelError::NoNode { .. }) => {
                    debug!("Resource {} unregistered while orphaning", resource.name)
                }
                Err(e) => return Err(e),
            }
        }
        standard::ORPHAN_RESOURCES.set(states.len() as i64);
        Ok(())
    }

    fn no_capacity(&self, reason: &str) {
        if !self.capacity_warned.swap(true, Ordering::Relaxed) {
            warn!("Cannot assign resources at epoch {}: {}", self.leader_epoch, reason);
        } else {
            debug!("Still cannot assign resources: {}", reason);
        }
    }

    /// Drain `triggers` until `shutdown` fires, coalescing bursts into one run.
    ///
    /// Failed or skipped runs schedule a [`RebalanceTrigger::Forced`] retry
    /// through `queue` after the configured delay.
    pub async fn run(
        self: Arc<Self>,
        mut triggers: TriggerReceiver,
        queue: TriggerSender,
        shutdown: ShutdownSignal,
    ) {
        loop {
            let trigger = tokio::select! {
                _ = shutdown.wait() => break,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            let mut trigger = trigger;
            while let Ok(next) = triggers.try_recv() {
                if next == RebalanceTrigger::Forced {
                    trigger = next;
                }
            }

            let retry = match self.rebalance(trigger).await {
                Ok(RebalanceOutcome::Applied { report, .. }) => !report.failed.is_empty(),
                Ok(RebalanceOutcome::Disconnected) => true,
                Ok(outcome) => {
                    debug!("Rebalance ({:?}) finished: {:?}", trigger, outcome);
                    false
                }
                Err(e) if e.is_connectivity() || e.is_retryable() => {
                    warn!("Rebalance ({:?}) interrupted: {}", trigger, e);
                    true
                }
                Err(e) => {
                    error!("Rebalance ({:?}) failed: {}", trigger, e);
                    true
                }
            };

            if retry {
                let queue = queue.clone();
                let shutdown = shutdown.clone();
                let delay = self.retry_delay;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.wait() => {}
                        _ = tokio::time::sleep(delay) => {
                            queue.send(RebalanceTrigger::Forced);
                        }
                    }
                });
            }
        }
        debug!("Rebalancer for epoch {} stopped", self.leader_epoch);
    }
}

/// Move resources off participants that renounced them.
///
/// Each such resource goes to the eligible participant with the fewest
/// resources (ties broken by endpoint) or stays unassigned when every
/// participant renounced it. Returns how many resources were moved or dropped.
fn apply_renunciations(decision: &mut Decision, states: &[(Resource, ResourceState)]) -> usize {
    let renounced: Vec<(Participant, &Resource, &ResourceState)> = {
        let owners = decision.owner_index();
        states
            .iter()
            .filter(|(_, state)| !state.renounced_by.is_empty())
            .filter_map(|(resource, state)| {
                let holder = owners.get(resource.name.as_str())?;
                state
                    .renounced_by
                    .contains(&holder.endpoint)
                    .then(|| ((*holder).clone(), resource, state))
            })
            .collect()
    };

    let mut moved = 0;
    for (holder, resource, state) in renounced {
        let Some(taken) = decision.remove(&holder, &resource.name) else {
            continue;
        };
        moved += 1;

        let target = decision
            .iter()
            .filter(|(p, _)| !state.renounced_by.contains(&p.endpoint))
            .min_by(|(a, ra), (b, rb)| ra.len().cmp(&rb.len()).then_with(|| a.cmp(b)))
            .map(|(p, _)| p.clone());
        match target {
            Some(target) => {
                debug!(
                    "Moving renounced resource {} from {} to {}",
                    taken.name, holder.endpoint, target.endpoint
                );
                decision.assign_sorted(&target, taken);
            }
            None => warn!(
                "Every live participant renounced {}; leaving it unassigned",
                taken.name
            ),
        }
    }
    moved
}
