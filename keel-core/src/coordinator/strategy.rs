//! Deterministic resource assignment
//!
//! A [`Strategy`] turns the live participants and registered resources into a
//! [`Decision`]. Implementations must be deterministic, include every
//! participant (possibly with an empty list) and keep each list sorted.

use tracing::debug;

use super::decision::Decision;
use super::membership::Participant;
use super::registry::Resource;

/// Assignment function run by the leader on every rebalance
pub trait Strategy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Compute a decision; inputs may arrive in any order
    fn assign(&self, participants: &[Participant], resources: &[Resource]) -> Decision;
}

/// Contiguous round-robin blocks.
///
/// Participants sorted by endpoint each receive `R / P` consecutive resources
/// from the name-sorted list, the first `R % P` of them one extra.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl Strategy for RoundRobin {
    fn name(&self) -> &str {
        "round-robin"
    }

    fn assign(&self, participants: &[Participant], resources: &[Resource]) -> Decision {
        let mut decision = Decision::new();
        if participants.is_empty() {
            return decision;
        }

        let mut participants = participants.to_vec();
        participants.sort();
        participants.dedup();
        let mut resources = resources.to_vec();
        resources.sort();

        let base = resources.len() / participants.len();
        let extra = resources.len() % participants.len();

        let mut remaining = resources.into_iter();
        for (idx, participant) in participants.into_iter().enumerate() {
            let take = base + usize::from(idx < extra);
            let block: Vec<Resource> = remaining.by_ref().take(take).collect();
            decision.insert(participant, block);
        }

        debug!(
            "Assigned {} resources to {} participants",
            decision.resource_count(),
            decision.len()
        );
        decision
    }
}

/// Adapts a closure into a [`Strategy`]
pub struct StrategyFn<F> {
    name: String,
    f: F,
}

impl<F> StrategyFn<F>
where
    F: Fn(&[Participant], &[Resource]) -> Decision + Send + Sync,
{
    /// Wrap `f` under `name`
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Strategy for StrategyFn<F>
where
    F: Fn(&[Participant], &[Resource]) -> Decision + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn assign(&self, participants: &[Participant], resources: &[Resource]) -> Decision {
        (self.f)(participants, resources)
    }
}
