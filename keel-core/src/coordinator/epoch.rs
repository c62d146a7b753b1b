//! Leader epoch tracking
//!
//! Persistent, monotonically increasing counter bumped by every newly
//! elected leader. Participants use it to fence pushes from superseded
//! leaders.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

use super::keys::KeySpace;
use crate::error::{KeelError, Result};
use crate::store::{CoordinationStore, CreateMode};

/// Epoch value before any leader has been elected
pub const NO_EPOCH: i64 = 0;

const BUMP_ATTEMPTS: u32 = 16;

/// Reads and advances the persisted leader epoch
pub struct LeaderEpoch {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
}

impl LeaderEpoch {
    /// Create a leader epoch handle
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Current epoch, [`NO_EPOCH`] if no leader was ever elected
    pub async fn current(&self) -> Result<i64> {
        let path = self.keys.leader_epoch();
        match self.store.get(&path).await {
            Ok((data, _)) => parse_epoch(&path, &data),
            Err(KeelError::NoNode { .. }) => Ok(NO_EPOCH),
            Err(e) => Err(e),
        }
    }

    /// Advance to the next epoch and return it; the first leader gets 1
    pub async fn advance(&self) -> Result<i64> {
        let path = self.keys.leader_epoch();
        for _ in 0..BUMP_ATTEMPTS {
            let written = match self.store.get(&path).await {
                Ok((data, stat)) => {
                    let next = parse_epoch(&path, &data)? + 1;
                    self.store
                        .set(&path, Bytes::from(next.to_string()), Some(stat.version))
                        .await
                        .map(|_| next)
                }
                Err(KeelError::NoNode { .. }) => {
                    let first = NO_EPOCH + 1;
                    self.store
                        .create(&path, Bytes::from(first.to_string()), CreateMode::Persistent)
                        .await
                        .map(|_| first)
                }
                Err(e) => return Err(e),
            };
            match written {
                Ok(epoch) => {
                    info!("Advanced to leader epoch {}", epoch);
                    return Ok(epoch);
                }
                Err(KeelError::BadVersion { .. }) | Err(KeelError::NodeExists { .. }) => {
                    debug!("Leader epoch changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(KeelError::Internal {
            message: "leader epoch kept changing while advancing".into(),
        })
    }
}

fn parse_epoch(path: &str, data: &[u8]) -> Result<i64> {
    std::str::from_utf8(data)
        .map_err(|e| KeelError::payload(path, e))?
        .trim()
        .parse::<i64>()
        .map_err(|e| KeelError::payload(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ensure_path, MemoryCluster};

    async fn epoch(cluster: &MemoryCluster) -> LeaderEpoch {
        let session = cluster.connect();
        ensure_path(session.as_ref(), "/keel").await.unwrap();
        LeaderEpoch::new(session, KeySpace::new("/keel").unwrap())
    }

    #[tokio::test]
    async fn test_first_leader_gets_one() {
        let cluster = MemoryCluster::new();
        let e = epoch(&cluster).await;

        assert_eq!(e.current().await.unwrap(), NO_EPOCH);
        assert_eq!(e.advance().await.unwrap(), 1);
        assert_eq!(e.advance().await.unwrap(), 2);
        assert_eq!(e.current().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_advances_are_distinct() {
        let cluster = MemoryCluster::new();
        let a = Arc::new(epoch(&cluster).await);
        let b = Arc::new(epoch(&cluster).await);

        let (x, y) = tokio::join!(a.advance(), b.advance());
        let (x, y) = (x.unwrap(), y.unwrap());
        assert_ne!(x, y);
        assert_eq!(a.current().await.unwrap(), x.max(y));
    }

    #[tokio::test]
    async fn test_garbage_epoch_is_reported() {
        let cluster = MemoryCluster::new();
        let e = epoch(&cluster).await;
        let session = cluster.connect();
        session
            .create("/keel/leader_epoch", Bytes::from("nope"), CreateMode::Persistent)
            .await
            .unwrap();

        assert!(matches!(
            e.current().await,
            Err(KeelError::InvalidPayload { .. })
        ));
    }
}
