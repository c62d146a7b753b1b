//! Process configuration
//!
//! Defaults suit a single local node; every field can be overridden through
//! `KEEL_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::distributor::ClientConfig;
use crate::coordinator::keys::KeySpace;
use crate::coordinator::membership::{validate_endpoint, DEFAULT_WEIGHT};
use crate::error::{KeelError, Result};
use crate::store::RetryConfig;
use crate::{DEFAULT_PORT, DEFAULT_ROOT};

/// Configuration for one Keel node
#[derive(Debug, Clone)]
pub struct KeelConfig {
    /// Key space root in the coordination store
    pub root: String,
    /// Endpoint other participants and the leader reach this node on
    pub endpoint: String,
    /// Capacity hint published with membership
    pub weight: i32,
    /// Local address the participant API binds to
    pub bind_addr: String,
    /// Backoff for store round trips and registration
    pub session_retry: RetryConfig,
    /// Decision RPC client timeouts
    pub client: ClientConfig,
    /// Delay before a failed distribution is retried
    pub rebalance_retry_delay: Duration,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.into(),
            endpoint: format!("127.0.0.1:{}", DEFAULT_PORT),
            weight: DEFAULT_WEIGHT,
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            session_retry: RetryConfig::default(),
            client: ClientConfig::default(),
            rebalance_retry_delay: Duration::from_secs(1),
        }
    }
}

impl KeelConfig {
    /// Load from the process environment and validate
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source and validate
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(root) = lookup("KEEL_ROOT") {
            config.root = root;
        }
        if let Some(endpoint) = lookup("KEEL_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(bind_addr) = lookup("KEEL_BIND_ADDR") {
            config.bind_addr = bind_addr;
        }
        if let Some(weight) = parse_var(&lookup, "KEEL_WEIGHT")? {
            config.weight = weight;
        }
        if let Some(attempts) = parse_var(&lookup, "KEEL_RETRY_ATTEMPTS")? {
            config.session_retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_var(&lookup, "KEEL_RETRY_BASE_MS")? {
            config.session_retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "KEEL_RETRY_MAX_MS")? {
            config.session_retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "KEEL_RPC_CONNECT_TIMEOUT_MS")? {
            config.client.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "KEEL_RPC_TIMEOUT_MS")? {
            config.client.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "KEEL_REBALANCE_RETRY_MS")? {
            config.rebalance_retry_delay = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        KeySpace::new(&self.root)?;
        validate_endpoint(&self.endpoint)?;
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("bind address {:?}: {}", self.bind_addr, e)))?;
        if self.weight < 0 {
            return Err(invalid(format!("weight must not be negative, got {}", self.weight)));
        }
        if self.session_retry.max_attempts == 0 {
            return Err(invalid("retry attempts must be at least 1"));
        }
        if self.session_retry.base_delay > self.session_retry.max_delay {
            return Err(invalid("retry base delay exceeds max delay"));
        }
        if self.client.request_timeout.is_zero() || self.client.connect_timeout.is_zero() {
            return Err(invalid("RPC timeouts must be non-zero"));
        }
        Ok(())
    }

    /// Key space for [`root`](Self::root)
    pub fn key_space(&self) -> Result<KeySpace> {
        KeySpace::new(&self.root)
    }
}

fn invalid(reason: impl Into<String>) -> KeelError {
    KeelError::InvalidConfig {
        reason: reason.into(),
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| invalid(format!("{}={:?}: {}", key, raw, e)))
        })
        .transpose()
}
