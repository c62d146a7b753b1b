//! Decision distribution
//!
//! Pushes each participant its share of a [`Decision`], tagged with the
//! leader epoch, over the participant RPC.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::decision::Decision;
use super::membership::{Participant, DEFAULT_WEIGHT};
use super::registry::Resource;
use crate::error::{KeelError, Result};
use crate::metrics::standard;

/// Participant's answer to a decision push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAck {
    /// Assignment adopted
    Accepted,
    /// Participant already follows a newer leader
    LeaderMoved { held_epoch: i64 },
}

/// Body of a successful push response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAccepted {
    pub accepted: bool,
    pub epoch: i64,
}

/// Body of a push rejected for carrying a stale epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRejected {
    pub error: String,
    pub held_epoch: i64,
}

/// RPC surface the leader uses to reach participants
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// Deliver `resources` as the participant's full assignment
    async fn push(
        &self,
        participant: &Participant,
        epoch: i64,
        resources: &[Resource],
    ) -> Result<PushAck>;

    /// Invoke an auxiliary admin method and return its raw response body
    async fn call(&self, participant: &Participant, method: &str, query: &str) -> Result<String>;
}

/// Configuration for the HTTP participant client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// [`ParticipantClient`] speaking the participant HTTP API
pub struct HttpParticipantClient {
    http: reqwest::Client,
}

impl HttpParticipantClient {
    /// Build a client with the given timeouts
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| KeelError::InvalidConfig {
                reason: format!("HTTP client: {}", e),
            })?;
        Ok(Self { http })
    }
}

fn rpc_failed(participant: &Participant, reason: impl ToString) -> KeelError {
    KeelError::RpcFailed {
        endpoint: participant.endpoint.clone(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl ParticipantClient for HttpParticipantClient {
    async fn push(
        &self,
        participant: &Participant,
        epoch: i64,
        resources: &[Resource],
    ) -> Result<PushAck> {
        let url = format!("http://{}/v1/rebalance", participant.endpoint);
        let response = self
            .http
            .post(&url)
            .query(&[("epoch", epoch)])
            .json(resources)
            .send()
            .await
            .map_err(|e| rpc_failed(participant, e))?;

        match response.status() {
            reqwest::StatusCode::OK => Ok(PushAck::Accepted),
            reqwest::StatusCode::CONFLICT => {
                let body: PushRejected =
                    response.json().await.map_err(|e| rpc_failed(participant, e))?;
                Ok(PushAck::LeaderMoved {
                    held_epoch: body.held_epoch,
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(rpc_failed(participant, format!("HTTP {}: {}", status, body)))
            }
        }
    }

    async fn call(&self, participant: &Participant, method: &str, query: &str) -> Result<String> {
        let mut url = format!(
            "http://{}/{}",
            participant.endpoint,
            method.trim_start_matches('/')
        );
        if !query.is_empty() {
            url.push('?');
            url.push_str(query.trim_start_matches('?'));
        }
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| rpc_failed(participant, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| rpc_failed(participant, e))?;
        if !status.is_success() {
            return Err(rpc_failed(participant, format!("HTTP {}: {}", status, body)));
        }
        Ok(body)
    }
}

/// Per-participant result of one distribution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReport {
    /// Endpoints that adopted the push
    pub accepted: Vec<String>,
    /// Endpoints following a newer leader, with the epoch they hold
    pub rejected: Vec<(String, i64)>,
    /// Endpoints that could not be reached
    pub failed: Vec<(String, String)>,
}

impl DistributionReport {
    /// True when every push was accepted
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty() && self.failed.is_empty()
    }

    /// Highest epoch reported by a participant that refused the push
    pub fn newer_epoch(&self) -> Option<i64> {
        self.rejected.iter().map(|(_, held)| *held).max()
    }
}

/// Sends decisions to participants
pub struct Distributor {
    client: Arc<dyn ParticipantClient>,
}

impl Distributor {
    /// Create a distributor over `client`
    pub fn new(client: Arc<dyn ParticipantClient>) -> Self {
        Self { client }
    }

    /// Push every participant its assignment concurrently.
    ///
    /// Endpoints in `previously_assigned` that no longer appear in the
    /// decision get an explicit empty push so they drop what they held.
    pub async fn distribute(
        &self,
        epoch: i64,
        decision: &Decision,
        previously_assigned: &BTreeSet<String>,
    ) -> DistributionReport {
        let mut targets: Vec<(Participant, Vec<Resource>)> = decision
            .iter()
            .map(|(p, resources)| (p.clone(), resources.clone()))
            .collect();
        for endpoint in previously_assigned {
            if decision.resources_for(endpoint).is_none() {
                debug!("Clearing assignment of departed participant {}", endpoint);
                targets.push((
                    Participant {
                        endpoint: endpoint.clone(),
                        weight: DEFAULT_WEIGHT,
                    },
                    Vec::new(),
                ));
            }
        }

        let pushes = targets.iter().map(|(participant, resources)| async move {
            let result = self.client.push(participant, epoch, resources).await;
            (participant, resources.len(), result)
        });

        let mut report = DistributionReport::default();
        for (participant, count, result) in join_all(pushes).await {
            match result {
                Ok(PushAck::Accepted) => {
                    debug!(
                        "Pushed {} resources to {} at epoch {}",
                        count, participant.endpoint, epoch
                    );
                    standard::DECISIONS_PUSHED.inc();
                    report.accepted.push(participant.endpoint.clone());
                }
                Ok(PushAck::LeaderMoved { held_epoch }) => {
                    warn!(
                        "Participant {} holds epoch {}, newer than ours ({})",
                        participant.endpoint, held_epoch, epoch
                    );
                    report.rejected.push((participant.endpoint.clone(), held_epoch));
                }
                Err(e) => {
                    error!("Failed to push decision to {}: {}", participant.endpoint, e);
                    standard::PUSH_FAILURES.inc();
                    report.failed.push((participant.endpoint.clone(), e.to_string()));
                }
            }
        }
        report
    }
}
