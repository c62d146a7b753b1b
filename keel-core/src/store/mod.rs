//! Coordination store abstraction
//!
//! Hierarchical store with ephemeral and persistent nodes, atomic
//! create-if-absent, versioned writes and one-shot watches. Everything above
//! this module talks to the store through [`CoordinationStore`] only.

pub mod memory;
pub mod retry;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, watch};

use crate::error::{KeelError, Result};

pub use memory::{MemoryCluster, MemorySession};
pub use retry::{retry, RetryConfig};

/// Lifetime of a created node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives until explicitly deleted
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
}

/// Node metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Data version, starts at 0 and increments on every write
    pub version: i64,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<u64>,
}

/// Event delivered to a one-shot watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// Watched node was created
    Created,
    /// Watched node was deleted
    Deleted,
    /// Watched node's data changed
    DataChanged,
    /// Watched node's child list changed
    ChildrenChanged,
    /// The session that registered the watch is gone
    SessionLost,
}

/// One-shot watch handle. A dropped sender is equivalent to `SessionLost`.
pub type Watch = oneshot::Receiver<WatchEvent>;

/// Connection state of a store session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected with the given session id
    Connected { session_id: u64 },
    /// Temporarily disconnected, session may still be alive
    Disconnected,
    /// Session expired, ephemeral nodes were removed
    Expired,
}

impl SessionState {
    /// Session id when connected
    pub fn session_id(&self) -> Option<u64> {
        match self {
            SessionState::Connected { session_id } => Some(*session_id),
            _ => None,
        }
    }
}

/// Coordination primitive used by membership, registry and election
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Current session state
    fn session_state(&self) -> SessionState;

    /// Subscribe to session state transitions
    fn session_events(&self) -> watch::Receiver<SessionState>;

    /// True while the session is connected
    fn is_connected(&self) -> bool {
        matches!(self.session_state(), SessionState::Connected { .. })
    }

    /// Atomically create a node; fails with `NodeExists` if present
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<()>;

    /// Read a node's data and metadata
    async fn get(&self, path: &str) -> Result<(Bytes, Stat)>;

    /// Overwrite a node's data, optionally checking its current version
    async fn set(&self, path: &str, data: Bytes, expected_version: Option<i64>) -> Result<Stat>;

    /// Delete a childless node, optionally checking its current version
    async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<()>;

    /// List child names (not full paths)
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Node metadata if the node exists
    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    /// List children and arm a one-shot watch on the child list
    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Read a node if present and arm a one-shot watch on its existence/data
    async fn watch_exists(&self, path: &str) -> Result<(Option<(Bytes, Stat)>, Watch)>;
}

/// Create every missing persistent node along `path`
pub async fn ensure_path(store: &dyn CoordinationStore, path: &str) -> Result<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        match store
            .create(&current, Bytes::new(), CreateMode::Persistent)
            .await
        {
            Ok(()) | Err(KeelError::NodeExists { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Delete a node, treating a missing node as success
pub async fn delete_if_present(store: &dyn CoordinationStore, path: &str) -> Result<()> {
    match store.delete(path, None).await {
        Ok(()) | Err(KeelError::NoNode { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Parent path of `path`, `/` for top-level nodes
pub(crate) fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/keel"), "/");
        assert_eq!(parent_of("/keel/leader"), "/keel");
        assert_eq!(parent_of("/keel/resources/a/state"), "/keel/resources/a");
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let cluster = MemoryCluster::new();
        let session = cluster.connect();

        ensure_path(session.as_ref(), "/keel/resources").await.unwrap();
        ensure_path(session.as_ref(), "/keel/resources").await.unwrap();

        assert!(session.exists("/keel").await.unwrap().is_some());
        assert!(session.exists("/keel/resources").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_if_present() {
        let cluster = MemoryCluster::new();
        let session = cluster.connect();

        delete_if_present(session.as_ref(), "/missing").await.unwrap();
        session
            .create("/x", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        delete_if_present(session.as_ref(), "/x").await.unwrap();
        assert!(session.exists("/x").await.unwrap().is_none());
    }
}
