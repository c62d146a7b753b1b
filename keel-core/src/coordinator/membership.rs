//! Participant membership
//!
//! Tracks participant liveness as ephemeral nodes in the coordination store.

use bytes::Bytes;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::keys::KeySpace;
use crate::error::{KeelError, Result};
use crate::store::{
    delete_if_present, ensure_path, CoordinationStore, CreateMode, RetryConfig, Watch,
};

/// Weight assumed when a participant node carries no readable weight
pub const DEFAULT_WEIGHT: i32 = 1;

/// A fleet member that can be assigned resources.
///
/// Identity is the endpoint: equality, ordering and hashing ignore weight.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Participant {
    /// `host:port` the participant serves its decision RPC on
    pub endpoint: String,
    /// Capacity hint, carried for weighted strategies
    pub weight: i32,
}

impl Participant {
    /// Create a participant, validating the endpoint
    pub fn new(endpoint: impl Into<String>, weight: i32) -> Result<Self> {
        let endpoint = endpoint.into();
        validate_endpoint(&endpoint)?;
        Ok(Self { endpoint, weight })
    }
}

impl PartialEq for Participant {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for Participant {}

impl Hash for Participant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
    }
}

impl PartialOrd for Participant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Participant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.endpoint.cmp(&other.endpoint)
    }
}

/// Validate that an endpoint is a `host:port` without path separators
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let invalid = |reason: &str| KeelError::InvalidEndpoint {
        endpoint: endpoint.into(),
        reason: reason.into(),
    };

    if endpoint.contains('/') {
        return Err(invalid("must not contain '/'"));
    }
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("invalid host"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid("invalid port")),
        Ok(_) => Ok(()),
    }
}

/// Registers and lists live participants
pub struct Membership {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    retry: RetryConfig,
}

impl Membership {
    /// Create a membership handle
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, retry: RetryConfig) -> Self {
        Self { store, keys, retry }
    }

    /// Register a participant as an ephemeral node owned by this session.
    ///
    /// Re-registering from the session that already owns the node succeeds.
    /// A node owned by another session is retried with backoff, since a
    /// previous session of this very process may not have been reaped yet;
    /// once the budget is spent the identity is reported as conflicting.
    pub async fn register(&self, participant: &Participant) -> Result<()> {
        validate_endpoint(&participant.endpoint)?;
        let path = self.keys.participant(&participant.endpoint);
        let attempts = self.retry.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            let err = match self.try_register(&path, participant).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            let transient =
                err.is_retryable() || matches!(err, KeelError::ParticipantConflict { .. });
            if !transient || attempt + 1 >= attempts {
                return Err(err);
            }
            let delay = self.retry.delay_for(attempt);
            warn!(
                "Registering {} failed ({}), retrying in {:?}",
                participant.endpoint, err, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn try_register(&self, path: &str, participant: &Participant) -> Result<()> {
        ensure_path(self.store.as_ref(), &self.keys.participants()).await?;
        let payload = Bytes::from(participant.weight.to_string());
        match self.store.create(path, payload, CreateMode::Ephemeral).await {
            Ok(()) => {
                info!(
                    "Registered participant {} (weight {})",
                    participant.endpoint, participant.weight
                );
                return Ok(());
            }
            Err(KeelError::NodeExists { .. }) => {}
            Err(e) => return Err(e),
        }

        let current = self.store.session_state().session_id();
        match self.store.exists(path).await? {
            Some(stat) if stat.ephemeral_owner.is_some() && stat.ephemeral_owner == current => {
                debug!("Participant {} already registered by this session", participant.endpoint);
                Ok(())
            }
            // Vanished between create and exists; the next attempt recreates it.
            None => Err(KeelError::ConnectionLoss),
            Some(stat) => {
                debug!(
                    "Participant {} held by session {:?}",
                    participant.endpoint, stat.ephemeral_owner
                );
                Err(KeelError::ParticipantConflict {
                    endpoint: participant.endpoint.clone(),
                })
            }
        }
    }

    /// Remove a participant node; a missing node is success
    pub async fn deregister(&self, endpoint: &str) -> Result<()> {
        delete_if_present(self.store.as_ref(), &self.keys.participant(endpoint)).await?;
        info!("Deregistered participant {}", endpoint);
        Ok(())
    }

    /// Live participants sorted by endpoint
    pub async fn live_participants(&self) -> Result<Vec<Participant>> {
        Ok(self
            .live_registrations()
            .await?
            .into_iter()
            .map(|(participant, _)| participant)
            .collect())
    }

    /// Live participants with the session that owns each registration.
    ///
    /// A participant that lost its session and registered again shows up
    /// under a different session id.
    pub async fn live_registrations(&self) -> Result<Vec<(Participant, Option<u64>)>> {
        let parent = self.keys.participants();
        let children = match self.store.children(&parent).await {
            Ok(children) => children,
            Err(KeelError::NoNode { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut registrations = Vec::with_capacity(children.len());
        for endpoint in children {
            let (data, stat) = match self.store.get(&self.keys.participant(&endpoint)).await {
                Ok(found) => found,
                Err(KeelError::NoNode { .. }) => continue,
                Err(e) => return Err(e),
            };
            let weight = std::str::from_utf8(&data)
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
                .unwrap_or_else(|| {
                    warn!("Participant {} has unreadable weight, using {}", endpoint, DEFAULT_WEIGHT);
                    DEFAULT_WEIGHT
                });
            registrations.push((Participant { endpoint, weight }, stat.ephemeral_owner));
        }
        registrations.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(registrations)
    }

    /// Arm a one-shot watch on the participant list
    pub async fn watch(&self) -> Result<(Vec<String>, Watch)> {
        ensure_path(self.store.as_ref(), &self.keys.participants()).await?;
        self.store.watch_children(&self.keys.participants()).await
    }
}
