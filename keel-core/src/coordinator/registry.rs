//! Resource registry
//!
//! Inventory of persistent resource nodes plus their per-resource ownership
//! state. No assignment logic lives here.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::keys::{decode_resource_name, validate_resource_name, KeySpace};
use crate::error::{KeelError, Result};
use crate::store::{delete_if_present, ensure_path, CoordinationStore, CreateMode, Watch};

/// Attempts for a compare-and-set state update before giving up
pub const STATE_CAS_ATTEMPTS: u32 = 8;

/// An assignable unit of replication work, identified by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    /// Input plugin that knows how to consume this resource
    pub input_plugin: String,
    /// Identity, typically a connection string
    pub name: String,
}

impl Resource {
    /// Create a resource
    pub fn new(input_plugin: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            input_plugin: input_plugin.into(),
            name: name.into(),
        }
    }
}

impl PartialOrd for Resource {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Resource {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.input_plugin.cmp(&other.input_plugin))
    }
}

/// Ownership state of one resource.
///
/// `leader_epoch == -1 && owner == ""` is the orphan state; the two fields are
/// only ever changed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Epoch of the leader that assigned the current owner
    pub leader_epoch: i64,
    /// Bumped on every ownership change
    pub version: i64,
    /// Endpoint of the owning participant
    pub owner: String,
    /// Participants that declared they cannot serve this resource
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub renounced_by: BTreeSet<String>,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::orphan()
    }
}

impl ResourceState {
    /// Fresh orphan state
    pub fn orphan() -> Self {
        Self {
            leader_epoch: -1,
            version: 0,
            owner: String::new(),
            renounced_by: BTreeSet::new(),
        }
    }

    /// True when nobody owns the resource
    pub fn is_orphan(&self) -> bool {
        self.leader_epoch == -1 && self.owner.is_empty()
    }

    /// Drop ownership; returns true if anything changed
    pub fn become_orphan(&mut self) -> bool {
        if self.is_orphan() {
            return false;
        }
        self.leader_epoch = -1;
        self.owner.clear();
        self.version += 1;
        true
    }

    /// Record `owner` as assigned by the leader of `leader_epoch`; returns true
    /// if anything changed
    pub fn assign(&mut self, owner: &str, leader_epoch: i64) -> bool {
        if self.owner == owner && self.leader_epoch == leader_epoch {
            return false;
        }
        self.owner = owner.into();
        self.leader_epoch = leader_epoch;
        self.version += 1;
        true
    }
}

/// CRUD over resource nodes and their state
pub struct ResourceRegistry {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
}

impl ResourceRegistry {
    /// Create a registry handle
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Register a resource. Registering an already-present resource is
    /// accepted; differing metadata is overwritten.
    pub async fn register_resource(&self, resource: &Resource) -> Result<()> {
        validate_resource_name(&resource.name)?;
        ensure_path(self.store.as_ref(), &self.keys.resources()).await?;

        let path = self.keys.resource(&resource.name);
        let payload = encode_json(&path, resource)?;
        match self
            .store
            .create(&path, payload.clone(), CreateMode::Persistent)
            .await
        {
            Ok(()) => info!("Registered resource {} ({})", resource.name, resource.input_plugin),
            Err(KeelError::NodeExists { .. }) => {
                let (existing, stat) = self.store.get(&path).await?;
                let existing: Resource = decode_json(&path, &existing)?;
                if existing != *resource {
                    self.store.set(&path, payload, Some(stat.version)).await?;
                    info!(
                        "Updated resource {} input plugin {} -> {}",
                        resource.name, existing.input_plugin, resource.input_plugin
                    );
                } else {
                    debug!("Resource {} already registered", resource.name);
                }
            }
            Err(e) => return Err(e),
        }

        let state_path = self.keys.resource_state(&resource.name);
        let state = encode_json(&state_path, &ResourceState::orphan())?;
        match self
            .store
            .create(&state_path, state, CreateMode::Persistent)
            .await
        {
            Ok(()) | Err(KeelError::NodeExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Unregister a resource and its state; absent resources are success
    pub async fn unregister_resource(&self, name: &str) -> Result<()> {
        validate_resource_name(name)?;
        delete_if_present(self.store.as_ref(), &self.keys.resource_state(name)).await?;
        delete_if_present(self.store.as_ref(), &self.keys.resource(name)).await?;
        info!("Unregistered resource {}", name);
        Ok(())
    }

    /// All registered resources sorted by name
    pub async fn registered_resources(&self) -> Result<Vec<Resource>> {
        let children = match self.store.children(&self.keys.resources()).await {
            Ok(children) => children,
            Err(KeelError::NoNode { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut resources = Vec::with_capacity(children.len());
        for segment in children {
            let name = decode_resource_name(&segment)?;
            let path = self.keys.resource(&name);
            match self.store.get(&path).await {
                Ok((data, _)) => resources.push(decode_json::<Resource>(&path, &data)?),
                Err(KeelError::NoNode { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        resources.sort();
        Ok(resources)
    }

    /// State of one resource together with the node version
    pub async fn resource_state(&self, name: &str) -> Result<(ResourceState, i64)> {
        let path = self.keys.resource_state(name);
        let (data, stat) = self.store.get(&path).await?;
        Ok((decode_json(&path, &data)?, stat.version))
    }

    /// Every registered resource with its state; a missing state reads as orphan
    pub async fn resource_states(&self) -> Result<Vec<(Resource, ResourceState)>> {
        let mut states = Vec::new();
        for resource in self.registered_resources().await? {
            let state = match self.resource_state(&resource.name).await {
                Ok((state, _)) => state,
                Err(KeelError::NoNode { .. }) => ResourceState::orphan(),
                Err(e) => return Err(e),
            };
            states.push((resource, state));
        }
        Ok(states)
    }

    /// Resources currently without an owner
    pub async fn orphaned_resources(&self) -> Result<Vec<Resource>> {
        Ok(self
            .resource_states()
            .await?
            .into_iter()
            .filter(|(_, state)| state.is_orphan())
            .map(|(resource, _)| resource)
            .collect())
    }

    /// Optimistically update a resource's state.
    ///
    /// `update` returns false when it made no change, in which case nothing is
    /// written. Version conflicts are retried against a fresh read.
    pub async fn update_state<F>(&self, name: &str, mut update: F) -> Result<ResourceState>
    where
        F: FnMut(&mut ResourceState) -> bool,
    {
        let path = self.keys.resource_state(name);
        for _ in 0..STATE_CAS_ATTEMPTS {
            let (mut state, version) = match self.resource_state(name).await {
                Ok((state, version)) => (state, Some(version)),
                Err(KeelError::NoNode { .. }) => (ResourceState::orphan(), None),
                Err(e) => return Err(e),
            };
            if !update(&mut state) {
                return Ok(state);
            }
            let payload = encode_json(&path, &state)?;
            let written = match version {
                Some(version) => self.store.set(&path, payload, Some(version)).await.map(|_| ()),
                None => {
                    if self.store.exists(&self.keys.resource(name)).await?.is_none() {
                        return Err(KeelError::NoNode {
                            path: self.keys.resource(name),
                        });
                    }
                    self.store.create(&path, payload, CreateMode::Persistent).await
                }
            };
            match written {
                Ok(()) => return Ok(state),
                Err(KeelError::BadVersion { .. }) | Err(KeelError::NodeExists { .. }) => {
                    debug!("State of {} changed concurrently, retrying", name);
                }
                Err(e) => return Err(e),
            }
        }
        Err(KeelError::Internal {
            message: format!("state of {} kept changing under update", name),
        })
    }

    /// Give resources back: `participant` is recorded as unwilling and each
    /// resource it owns is marked orphan, then the leader is poked through the
    /// renunciation watch. Ownership held by someone else is left alone.
    pub async fn renounce_resources(&self, participant: &str, resources: &[Resource]) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }
        for resource in resources {
            let result = self
                .update_state(&resource.name, |state| {
                    let orphaned = state.owner == participant && state.become_orphan();
                    let recorded = state.renounced_by.insert(participant.to_string());
                    orphaned || recorded
                })
                .await;
            match result {
                Ok(_) => warn!("Participant {} renounced resource {}", participant, resource.name),
                Err(KeelError::NoNode { .. }) => {
                    debug!("Renounced resource {} is no longer registered", resource.name)
                }
                Err(e) => return Err(e),
            }
        }
        self.store
            .set(&self.keys.resources(), Bytes::new(), None)
            .await?;
        Ok(())
    }

    /// Forget every renunciation `participant` made in an earlier session.
    ///
    /// Returns how many resources were touched.
    pub async fn withdraw_renunciations(&self, participant: &str) -> Result<usize> {
        let mut withdrawn = 0;
        for (resource, state) in self.resource_states().await? {
            if !state.renounced_by.contains(participant) {
                continue;
            }
            match self
                .update_state(&resource.name, |state| state.renounced_by.remove(participant))
                .await
            {
                Ok(_) => withdrawn += 1,
                Err(KeelError::NoNode { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if withdrawn > 0 {
            info!("{} withdrew {} earlier renunciations", participant, withdrawn);
        }
        Ok(withdrawn)
    }

    /// Arm a one-shot watch on the resource list
    pub async fn watch(&self) -> Result<(Vec<String>, Watch)> {
        ensure_path(self.store.as_ref(), &self.keys.resources()).await?;
        self.store.watch_children(&self.keys.resources()).await
    }

    /// Arm a one-shot watch that fires when a participant renounces resources
    pub async fn watch_renunciations(&self) -> Result<Watch> {
        ensure_path(self.store.as_ref(), &self.keys.resources()).await?;
        let (_, watch) = self.store.watch_exists(&self.keys.resources()).await?;
        Ok(watch)
    }
}

fn encode_json<T: Serialize>(path: &str, value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| KeelError::payload(path, e))
}

fn decode_json<T: for<'de> Deserialize<'de>>(path: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| KeelError::payload(path, e))
}
