//! Error types for Keel
//!
//! Error taxonomy covering the coordination store, identity validation,
//! leadership and assignment distribution.

use thiserror::Error;

/// Primary error type for all Keel operations
#[derive(Debug, Error)]
pub enum KeelError {
    // ========== Coordination Connectivity ==========

    /// Connection to the coordination store is currently down
    #[error("Connection to coordination store lost")]
    ConnectionLoss,

    /// The coordination session expired; ephemeral nodes are gone
    #[error("Coordination session {session_id} expired")]
    SessionExpired { session_id: u64 },

    // ========== Store Conflicts ==========

    /// Node already exists
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    /// Node does not exist
    #[error("Node not found: {path}")]
    NoNode { path: String },

    /// Versioned write lost an optimistic concurrency race
    #[error("Version conflict on {path}: expected {expected}, found {actual}")]
    BadVersion { path: String, expected: i64, actual: i64 },

    /// Node still has children
    #[error("Node {path} has children")]
    NotEmpty { path: String },

    // ========== Invalid Identity ==========

    /// Participant endpoint is malformed
    #[error("Invalid participant endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Resource name cannot be stored in the key space
    #[error("Invalid resource name {name:?}: {reason}")]
    InvalidResourceName { name: String, reason: String },

    /// Key space root is malformed
    #[error("Invalid key space root {root:?}")]
    InvalidRoot { root: String },

    // ========== Membership & Leadership ==========

    /// Another live session holds this participant identity
    #[error("Participant {endpoint} is registered by another session")]
    ParticipantConflict { endpoint: String },

    /// Operation requires the caller to be the current leader
    #[error("This participant is not the leader")]
    NotLeader,

    // ========== Distribution ==========

    /// RPC to a participant failed
    #[error("RPC to {endpoint} failed: {reason}")]
    RpcFailed { endpoint: String, reason: String },

    /// Local pipeline collaborator failed
    #[error("Pipeline consumer for {input_plugin} failed: {reason}")]
    ConsumerFailed { input_plugin: String, reason: String },

    // ========== Data & Config ==========

    /// Stored payload could not be decoded
    #[error("Invalid payload at {path}: {reason}")]
    InvalidPayload { path: String, reason: String },

    /// Configuration is invalid
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ========== Runtime ==========

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl KeelError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeelError::ConnectionLoss | KeelError::RpcFailed { .. }
        )
    }

    /// Returns true if the error is a coordination connectivity fault
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            KeelError::ConnectionLoss | KeelError::SessionExpired { .. }
        )
    }

    /// Returns true if the error signals an identity rejected at registration
    pub fn is_invalid_identity(&self) -> bool {
        matches!(
            self,
            KeelError::InvalidEndpoint { .. }
                | KeelError::InvalidResourceName { .. }
                | KeelError::InvalidRoot { .. }
        )
    }

    /// HTTP status used when the error crosses the admin or participant API
    pub fn http_status(&self) -> u16 {
        match self {
            KeelError::NoNode { .. } => 404,
            KeelError::InvalidEndpoint { .. }
            | KeelError::InvalidResourceName { .. }
            | KeelError::InvalidRoot { .. }
            | KeelError::InvalidConfig { .. } => 422,
            KeelError::NotLeader
            | KeelError::ParticipantConflict { .. }
            | KeelError::NodeExists { .. }
            | KeelError::BadVersion { .. } => 409,
            KeelError::ConnectionLoss | KeelError::SessionExpired { .. } => 503,
            KeelError::RpcFailed { .. } => 502,
            _ => 500,
        }
    }

    pub(crate) fn payload(path: &str, reason: impl ToString) -> Self {
        KeelError::InvalidPayload {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for Keel operations
pub type Result<T> = std::result::Result<T, KeelError>;
