//! Cluster control plane
//!
//! Membership, the resource registry, leader election and the rebalancer
//! that assigns resources to participants.

pub mod decision;
pub mod distributor;
pub mod epoch;
pub mod keys;
pub mod leader;
pub mod membership;
pub mod rebalancer;
pub mod registry;
pub mod strategy;

pub use decision::{Decision, DecisionView};
pub use distributor::{
    ClientConfig, DistributionReport, Distributor, HttpParticipantClient, ParticipantClient,
    PushAck,
};
pub use epoch::LeaderEpoch;
pub use keys::KeySpace;
pub use leader::{ElectionConfig, ElectionState, LeaderElection};
pub use membership::{Membership, Participant};
pub use rebalancer::{PublishedDecision, RebalanceOutcome, RebalanceTrigger, Rebalancer};
pub use registry::{Resource, ResourceRegistry, ResourceState};
pub use strategy::{RoundRobin, Strategy, StrategyFn};
