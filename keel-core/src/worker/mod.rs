//! Participant side
//!
//! Receives decisions from the leader, fences them by epoch and drives the
//! local replication pipeline.

pub mod pipeline;
pub mod server;
pub mod state;

pub use pipeline::{ConsumerRegistry, Pausable, RegistryRenouncer, Renouncer, ResourceConsumer};
pub use server::router;
pub use state::{ApplyOutcome, AssignmentReceiver};
