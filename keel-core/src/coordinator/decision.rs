//! Assignment decisions
//!
//! A [`Decision`] maps every live participant to the resources it should
//! serve. It is recomputed from scratch on every rebalance.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::membership::Participant;
use super::registry::Resource;

/// Resource assignment computed by the leader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    assignments: BTreeMap<Participant, Vec<Resource>>,
}

impl Decision {
    /// Empty decision
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure `participant` appears, with no resources if it had none
    pub fn add_participant(&mut self, participant: Participant) {
        self.assignments.entry(participant).or_default();
    }

    /// Append a resource to a participant's list
    pub fn assign(&mut self, participant: &Participant, resource: Resource) {
        self.assignments
            .entry(participant.clone())
            .or_default()
            .push(resource);
    }

    /// Replace a participant's list
    pub fn insert(&mut self, participant: Participant, resources: Vec<Resource>) {
        self.assignments.insert(participant, resources);
    }

    /// Resources assigned to the participant with `endpoint`
    pub fn resources_for(&self, endpoint: &str) -> Option<&[Resource]> {
        self.assignments
            .iter()
            .find(|(p, _)| p.endpoint == endpoint)
            .map(|(_, resources)| resources.as_slice())
    }

    /// Participant owning the resource called `name`
    pub fn owner_of(&self, name: &str) -> Option<&Participant> {
        self.assignments
            .iter()
            .find(|(_, resources)| resources.iter().any(|r| r.name == name))
            .map(|(p, _)| p)
    }

    /// Participants in endpoint order
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.assignments.keys()
    }

    /// `(participant, resources)` pairs in endpoint order
    pub fn iter(&self) -> impl Iterator<Item = (&Participant, &Vec<Resource>)> {
        self.assignments.iter()
    }

    /// Resource name to owning participant, built in one pass
    pub fn owner_index(&self) -> HashMap<&str, &Participant> {
        self.assignments
            .iter()
            .flat_map(|(p, resources)| resources.iter().map(move |r| (r.name.as_str(), p)))
            .collect()
    }

    /// Remove the resource called `name` from `participant`'s list
    pub fn remove(&mut self, participant: &Participant, name: &str) -> Option<Resource> {
        let resources = self.assignments.get_mut(participant)?;
        let idx = resources.iter().position(|r| r.name == name)?;
        Some(resources.remove(idx))
    }

    /// Add a resource at its sorted position in the participant's list
    pub fn assign_sorted(&mut self, participant: &Participant, resource: Resource) {
        let resources = self.assignments.entry(participant.clone()).or_default();
        let idx = resources.partition_point(|r| *r < resource);
        resources.insert(idx, resource);
    }

    /// Number of participants
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// True when no participant appears
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Total number of assigned resources
    pub fn resource_count(&self) -> usize {
        self.assignments.values().map(Vec::len).sum()
    }

    /// Order-sensitive comparison: same participants, and for each the same
    /// resources in the same order.
    pub fn equals(&self, other: &Decision) -> bool {
        self == other
    }

    /// No resource appears under more than one participant
    pub fn is_exclusive(&self) -> bool {
        let mut seen = HashSet::new();
        self.assignments
            .values()
            .flatten()
            .all(|r| seen.insert(r.name.as_str()))
    }

    /// Every participant's list is sorted by resource order
    pub fn is_canonical(&self) -> bool {
        self.assignments
            .values()
            .all(|resources| resources.windows(2).all(|w| w[0] <= w[1]))
    }

    /// Serializable snapshot for the admin surface
    pub fn view(&self, leader_epoch: i64, computed_at: DateTime<Utc>) -> DecisionView {
        DecisionView {
            leader_epoch,
            computed_at,
            assignments: self
                .assignments
                .iter()
                .map(|(p, resources)| AssignmentView {
                    endpoint: p.endpoint.clone(),
                    weight: p.weight,
                    resources: resources.clone(),
                })
                .collect(),
        }
    }
}

/// One participant's share of a [`DecisionView`]
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentView {
    pub endpoint: String,
    pub weight: i32,
    pub resources: Vec<Resource>,
}

/// JSON shape of a decision
#[derive(Debug, Clone, Serialize)]
pub struct DecisionView {
    pub leader_epoch: i64,
    pub computed_at: DateTime<Utc>,
    pub assignments: Vec<AssignmentView>,
}
