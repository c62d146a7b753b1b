//! In-memory coordination store
//!
//! A [`MemoryCluster`] plays the role of the coordination service; each
//! [`MemorySession`] is one client connection with its own session id.
//! Sessions support fault injection (`disconnect`, `reconnect`, `expire`) so
//! session loss can be exercised without a real ensemble.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::{parent_of, CoordinationStore, CreateMode, SessionState, Stat, Watch, WatchEvent};
use crate::error::{KeelError, Result};

struct Node {
    data: Bytes,
    version: i64,
    ephemeral_owner: Option<u64>,
}

impl Node {
    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

type Watchers = HashMap<String, Vec<(u64, oneshot::Sender<WatchEvent>)>>;

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<String, Node>,
    next_session_id: u64,
    data_watches: Watchers,
    child_watches: Watchers,
}

impl ClusterState {
    fn contains(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn allocate_session(&mut self) -> u64 {
        self.next_session_id += 1;
        self.next_session_id
    }

    fn fire(watchers: &mut Watchers, path: &str, event: WatchEvent) {
        if let Some(list) = watchers.remove(path) {
            for (_, tx) in list {
                let _ = tx.send(event);
            }
        }
    }

    fn fire_session_lost(&mut self, session_id: u64) {
        for watchers in [&mut self.data_watches, &mut self.child_watches] {
            for list in watchers.values_mut() {
                let (lost, kept): (Vec<_>, Vec<_>) =
                    list.drain(..).partition(|(owner, _)| *owner == session_id);
                *list = kept;
                for (_, tx) in lost {
                    let _ = tx.send(WatchEvent::SessionLost);
                }
            }
            watchers.retain(|_, list| !list.is_empty());
        }
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            Self::fire(&mut self.data_watches, path, WatchEvent::Deleted);
            Self::fire(&mut self.child_watches, path, WatchEvent::Deleted);
            Self::fire(&mut self.child_watches, parent_of(path), WatchEvent::ChildrenChanged);
        }
    }

    fn drop_ephemerals(&mut self, session_id: u64) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.remove_node(path);
        }
        owned.len()
    }
}

fn validate_path(path: &str) -> Result<()> {
    let well_formed = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if well_formed {
        Ok(())
    } else {
        Err(KeelError::Internal {
            message: format!("malformed store path {:?}", path),
        })
    }
}

/// In-process coordination service shared by many sessions
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session
    pub fn connect(&self) -> Arc<MemorySession> {
        let session_id = self.state.lock().allocate_session();
        let (state_tx, _) = watch::channel(SessionState::Connected { session_id });
        Arc::new(MemorySession {
            cluster: self.clone(),
            session_id: AtomicU64::new(session_id),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            state_tx,
        })
    }

    /// Number of stored nodes
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Read raw node data regardless of any session
    pub fn peek(&self, path: &str) -> Option<Bytes> {
        self.state.lock().nodes.get(path).map(|n| n.data.clone())
    }
}

/// One client session against a [`MemoryCluster`]
pub struct MemorySession {
    cluster: MemoryCluster,
    session_id: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    state_tx: watch::Sender<SessionState>,
}

impl MemorySession {
    /// Current session id
    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    /// Simulate a transient network partition; the session stays alive
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.state_tx.send_replace(SessionState::Disconnected);
    }

    /// Restore connectivity after [`disconnect`](Self::disconnect)
    pub fn reconnect(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.connected.store(true, Ordering::SeqCst);
        self.state_tx.send_replace(SessionState::Connected {
            session_id: self.session_id(),
        });
    }

    /// Expire the session: ephemeral nodes vanish, watches fire `SessionLost`,
    /// then a fresh session is established.
    pub fn expire(&self) {
        let old = self.session_id();
        let new = {
            let mut state = self.cluster.state.lock();
            let dropped = state.drop_ephemerals(old);
            state.fire_session_lost(old);
            debug!("Session {} expired, {} ephemeral nodes removed", old, dropped);
            state.allocate_session()
        };
        self.state_tx.send_replace(SessionState::Expired);
        self.session_id.store(new, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.state_tx
            .send_replace(SessionState::Connected { session_id: new });
    }

    /// Close the session for good, removing its ephemeral nodes
    pub fn close(&self) {
        let sid = self.session_id();
        {
            let mut state = self.cluster.state.lock();
            state.drop_ephemerals(sid);
            state.fire_session_lost(sid);
        }
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.state_tx.send_replace(SessionState::Expired);
    }

    fn check(&self, path: &str) -> Result<u64> {
        validate_path(path)?;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(KeelError::ConnectionLoss);
        }
        Ok(self.session_id())
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn session_events(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<()> {
        let sid = self.check(path)?;
        if path == "/" {
            return Err(KeelError::NodeExists { path: path.into() });
        }
        let mut state = self.cluster.state.lock();
        if state.contains(path) {
            return Err(KeelError::NodeExists { path: path.into() });
        }
        let parent = parent_of(path);
        if !state.contains(parent) {
            return Err(KeelError::NoNode {
                path: parent.into(),
            });
        }
        let ephemeral_owner = match mode {
            CreateMode::Ephemeral => Some(sid),
            CreateMode::Persistent => None,
        };
        state.nodes.insert(
            path.into(),
            Node {
                data,
                version: 0,
                ephemeral_owner,
            },
        );
        ClusterState::fire(&mut state.data_watches, path, WatchEvent::Created);
        ClusterState::fire(&mut state.child_watches, parent, WatchEvent::ChildrenChanged);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<(Bytes, Stat)> {
        self.check(path)?;
        let state = self.cluster.state.lock();
        state
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat()))
            .ok_or_else(|| KeelError::NoNode { path: path.into() })
    }

    async fn set(&self, path: &str, data: Bytes, expected_version: Option<i64>) -> Result<Stat> {
        self.check(path)?;
        let mut state = self.cluster.state.lock();
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| KeelError::NoNode { path: path.into() })?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(KeelError::BadVersion {
                    path: path.into(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data;
        node.version += 1;
        let stat = node.stat();
        ClusterState::fire(&mut state.data_watches, path, WatchEvent::DataChanged);
        Ok(stat)
    }

    async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<()> {
        self.check(path)?;
        let mut state = self.cluster.state.lock();
        let version = state
            .nodes
            .get(path)
            .map(|node| node.version)
            .ok_or_else(|| KeelError::NoNode { path: path.into() })?;
        if let Some(expected) = expected_version {
            if version != expected {
                return Err(KeelError::BadVersion {
                    path: path.into(),
                    expected,
                    actual: version,
                });
            }
        }
        if !state.children_of(path).is_empty() {
            return Err(KeelError::NotEmpty { path: path.into() });
        }
        state.remove_node(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check(path)?;
        let state = self.cluster.state.lock();
        if !state.contains(path) {
            return Err(KeelError::NoNode { path: path.into() });
        }
        Ok(state.children_of(path))
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        self.check(path)?;
        let state = self.cluster.state.lock();
        Ok(state.nodes.get(path).map(Node::stat))
    }

    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let sid = self.check(path)?;
        let mut state = self.cluster.state.lock();
        if !state.contains(path) {
            return Err(KeelError::NoNode { path: path.into() });
        }
        let children = state.children_of(path);
        let (tx, rx) = oneshot::channel();
        state
            .child_watches
            .entry(path.into())
            .or_default()
            .push((sid, tx));
        Ok((children, rx))
    }

    async fn watch_exists(&self, path: &str) -> Result<(Option<(Bytes, Stat)>, Watch)> {
        let sid = self.check(path)?;
        let mut state = self.cluster.state.lock();
        let current = state
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat()));
        let (tx, rx) = oneshot::channel();
        state
            .data_watches
            .entry(path.into())
            .or_default()
            .push((sid, tx));
        Ok((current, rx))
    }
}
