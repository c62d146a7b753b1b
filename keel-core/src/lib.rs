//! Keel Core - control plane for a distributed change-data-capture fleet
//!
//! This crate coordinates a fleet of replication participants:
//! - Participant membership and resource inventory in a coordination store
//! - Leader election with a persisted, monotonic leader epoch
//! - Deterministic rebalancing and epoch-fenced decision distribution
//! - Participant-side reconciliation of the local pipeline

pub mod admin;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod metrics;
pub mod node;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use config::KeelConfig;
pub use error::{KeelError, Result};
pub use node::{Node, NodeBuilder};

/// Default key space root in the coordination store
pub const DEFAULT_ROOT: &str = "/keel";

/// Default port of the participant HTTP API
pub const DEFAULT_PORT: u16 = 7070;
