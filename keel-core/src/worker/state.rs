//! Participant assignment state
//!
//! Receives decision pushes, fences them by leader epoch and reconciles the
//! local pipeline with the assignment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::pipeline::{ConsumerHandle, ConsumerRegistry, Renouncer};
use crate::coordinator::registry::Resource;
use crate::error::{KeelError, Result};
use crate::metrics::standard;

/// Result of applying one push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Push carried an epoch older than the one held; nothing changed
    Rejected { held_epoch: i64 },
    /// Push adopted
    Accepted {
        started: Vec<Resource>,
        stopped: Vec<Resource>,
        renounced: Vec<Resource>,
    },
}

#[derive(Default)]
struct Held {
    epoch: i64,
    /// Resources fed to each consumer, keyed by input plugin
    owned: BTreeMap<String, Vec<Resource>>,
}

impl Held {
    fn all(&self) -> BTreeSet<Resource> {
        self.owned.values().flatten().cloned().collect()
    }
}

/// Local side of the decision RPC
pub struct AssignmentReceiver {
    endpoint: String,
    consumers: ConsumerRegistry,
    renouncer: Arc<dyn Renouncer>,
    held: Mutex<Held>,
}

impl AssignmentReceiver {
    /// Create a receiver for the participant at `endpoint`
    pub fn new(
        endpoint: impl Into<String>,
        consumers: ConsumerRegistry,
        renouncer: Arc<dyn Renouncer>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            consumers,
            renouncer,
            held: Mutex::new(Held::default()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Highest leader epoch accepted so far
    pub async fn held_epoch(&self) -> i64 {
        self.held.lock().await.epoch
    }

    /// Resources currently fed to the pipeline, sorted
    pub async fn owned(&self) -> Vec<Resource> {
        self.held.lock().await.all().into_iter().collect()
    }

    /// Apply a full assignment pushed by the leader of `epoch`.
    ///
    /// Pushes from an older epoch are rejected without side effects. Resources
    /// whose input plugin has no local consumer are renounced.
    pub async fn apply(&self, epoch: i64, resources: Vec<Resource>) -> Result<ApplyOutcome> {
        let mut held = self.held.lock().await;
        if epoch < held.epoch {
            standard::STALE_EPOCH_REJECTIONS.inc();
            warn!(
                "Rejected push from stale leader: epoch {} < held {}",
                epoch, held.epoch
            );
            return Ok(ApplyOutcome::Rejected {
                held_epoch: held.epoch,
            });
        }
        held.epoch = epoch;

        let (servable, unservable): (Vec<Resource>, Vec<Resource>) = resources
            .into_iter()
            .partition(|r| self.consumers.contains(&r.input_plugin));
        let wanted: BTreeSet<Resource> = servable.into_iter().collect();
        let current = held.all();
        let started: Vec<Resource> = wanted.difference(&current).cloned().collect();
        let stopped: Vec<Resource> = current.difference(&wanted).cloned().collect();

        let mut failure = None;
        if started.is_empty() && stopped.is_empty() {
            debug!("Assignment at epoch {} unchanged", epoch);
        } else {
            info!(
                "Assignment at epoch {}: starting {}, stopping {}",
                epoch,
                started.len(),
                stopped.len()
            );
            for (input_plugin, handle) in self.consumers.iter() {
                let subset: Vec<Resource> = wanted
                    .iter()
                    .filter(|r| r.input_plugin == *input_plugin)
                    .cloned()
                    .collect();
                match feed(input_plugin, handle, subset.clone()).await {
                    Ok(()) => {
                        held.owned.insert(input_plugin.clone(), subset);
                    }
                    Err(e) => {
                        warn!("Consumer {} rejected its assignment: {}", input_plugin, e);
                        failure.get_or_insert(e);
                    }
                }
            }
        }
        drop(held);

        if !unservable.is_empty() {
            warn!(
                "No consumer for {} assigned resources, renouncing them",
                unservable.len()
            );
            match self.renouncer.renounce_resources(&unservable).await {
                Ok(()) => standard::RENOUNCED_RESOURCES.inc_by(unservable.len() as u64),
                Err(e) => warn!("Renouncing resources failed: {}", e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(ApplyOutcome::Accepted {
                started,
                stopped,
                renounced: unservable,
            }),
        }
    }

    /// Stop everything held locally; the held epoch is kept for fencing
    pub async fn release_all(&self) {
        let mut held = self.held.lock().await;
        let owned = std::mem::take(&mut held.owned);
        for (input_plugin, resources) in owned {
            if resources.is_empty() {
                continue;
            }
            let Some(handle) = self.consumers.get(&input_plugin) else {
                continue;
            };
            info!("Releasing {} resources of {}", resources.len(), input_plugin);
            if let Err(e) = feed(&input_plugin, handle, Vec::new()).await {
                warn!("Consumer {} failed to release resources: {}", input_plugin, e);
            }
        }
    }

    /// Pause every consumer that supports it; returns how many were paused
    pub async fn pause(&self) -> Result<usize> {
        let mut paused = 0;
        for (_, handle) in self.consumers.iter() {
            if let Some(p) = &handle.pausable {
                p.pause().await?;
                paused += 1;
            }
        }
        Ok(paused)
    }

    /// Resume every consumer that supports it; returns how many were resumed
    pub async fn resume(&self) -> Result<usize> {
        let mut resumed = 0;
        for (_, handle) in self.consumers.iter() {
            if let Some(p) = &handle.pausable {
                p.resume().await?;
                resumed += 1;
            }
        }
        Ok(resumed)
    }
}

async fn feed(input_plugin: &str, handle: &ConsumerHandle, resources: Vec<Resource>) -> Result<()> {
    let wrap = |e: KeelError| KeelError::ConsumerFailed {
        input_plugin: input_plugin.into(),
        reason: e.to_string(),
    };
    if let Some(p) = &handle.pausable {
        p.pause().await.map_err(wrap)?;
    }
    let fed = handle.consumer.feed_resources(resources).await.map_err(wrap);
    if let Some(p) = &handle.pausable {
        p.resume().await.map_err(wrap)?;
    }
    fed
}
