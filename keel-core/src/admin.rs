//! Operator surface
//!
//! Inventory management, cluster inspection and forced rebalances, exposed
//! both as a Rust API and as HTTP routes under `/v1/admin`.

use axum::{
    extract::{Path, RawQuery, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::coordinator::decision::DecisionView;
use crate::coordinator::distributor::ParticipantClient;
use crate::coordinator::leader::LeaderElection;
use crate::coordinator::membership::{Membership, Participant};
use crate::coordinator::rebalancer::{RebalanceOutcome, RebalanceTrigger};
use crate::coordinator::registry::{Resource, ResourceRegistry};
use crate::error::{KeelError, Result};
use crate::http::{error_response, ErrorResponse};

/// Administrative handle onto one node's view of the cluster
#[derive(Clone)]
pub struct Admin {
    membership: Arc<Membership>,
    registry: Arc<ResourceRegistry>,
    election: Arc<LeaderElection>,
    client: Arc<dyn ParticipantClient>,
}

impl Admin {
    pub fn new(
        membership: Arc<Membership>,
        registry: Arc<ResourceRegistry>,
        election: Arc<LeaderElection>,
        client: Arc<dyn ParticipantClient>,
    ) -> Self {
        Self {
            membership,
            registry,
            election,
            client,
        }
    }

    pub async fn registered_resources(&self) -> Result<Vec<Resource>> {
        self.registry.registered_resources().await
    }

    pub async fn register_resource(&self, resource: &Resource) -> Result<()> {
        self.registry.register_resource(resource).await
    }

    pub async fn unregister_resource(&self, name: &str) -> Result<()> {
        self.registry.unregister_resource(name).await
    }

    pub async fn orphaned_resources(&self) -> Result<Vec<Resource>> {
        self.registry.orphaned_resources().await
    }

    pub async fn live_participants(&self) -> Result<Vec<Participant>> {
        self.membership.live_participants().await
    }

    /// Endpoint of the current leader, if one is elected
    pub async fn leader(&self) -> Result<Option<String>> {
        self.election.current_leader().await
    }

    /// Decision published by this node's leader term
    pub fn current_decision(&self) -> Option<DecisionView> {
        self.election
            .published()
            .read()
            .as_ref()
            .map(|p| p.decision.view(p.leader_epoch, p.computed_at))
    }

    /// Force a rebalance; only the leader can do this
    pub async fn rebalance(&self) -> Result<RebalanceOutcome> {
        let term = self.election.current_term().ok_or(KeelError::NotLeader)?;
        info!("Forced rebalance at epoch {}", term.leader_epoch());
        term.rebalance(RebalanceTrigger::Forced).await
    }

    /// Invoke `method` on every live participant concurrently.
    ///
    /// Per-participant failures are reported in the map, not as an error.
    pub async fn call_participants(
        &self,
        method: &str,
        query: &str,
    ) -> Result<BTreeMap<String, std::result::Result<String, String>>> {
        let participants = self.membership.live_participants().await?;
        let calls = participants.iter().map(|p| async move {
            let result = self
                .client
                .call(p, method, query)
                .await
                .map_err(|e| e.to_string());
            (p.endpoint.clone(), result)
        });
        Ok(join_all(calls).await.into_iter().collect())
    }
}

// ============================================================================
// HTTP routes
// ============================================================================

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Serialize)]
struct LeaderResponse {
    leader: Option<String>,
}

#[derive(Serialize)]
struct ParticipantResponse {
    endpoint: String,
    weight: i32,
}

/// JSON summary of a [`RebalanceOutcome`]
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct RebalanceSummary {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_epoch: Option<i64>,
    pub participants: usize,
    pub resources: usize,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub failed: Vec<String>,
}

impl From<&RebalanceOutcome> for RebalanceSummary {
    fn from(outcome: &RebalanceOutcome) -> Self {
        let mut summary = RebalanceSummary {
            outcome: "",
            held_epoch: None,
            participants: 0,
            resources: 0,
            accepted: Vec::new(),
            rejected: Vec::new(),
            failed: Vec::new(),
        };
        summary.outcome = match outcome {
            RebalanceOutcome::Disconnected => "disconnected",
            RebalanceOutcome::NoParticipants => "no_participants",
            RebalanceOutcome::NoResources => "no_resources",
            RebalanceOutcome::Unchanged => "unchanged",
            RebalanceOutcome::Superseded { held_epoch } => {
                summary.held_epoch = Some(*held_epoch);
                "superseded"
            }
            RebalanceOutcome::Applied {
                participants,
                resources,
                report,
            } => {
                summary.participants = *participants;
                summary.resources = *resources;
                summary.accepted = report.accepted.clone();
                summary.rejected = report.rejected.iter().map(|(e, _)| e.clone()).collect();
                summary.failed = report.failed.iter().map(|(e, _)| e.clone()).collect();
                "applied"
            }
        };
        summary
    }
}

#[derive(Serialize)]
struct CallResponse {
    ok: BTreeMap<String, String>,
    failed: BTreeMap<String, String>,
}

/// Build the admin router
pub fn router(admin: Admin) -> Router {
    Router::new()
        .route("/v1/admin/resources", get(list_resources).post(register_resource))
        .route("/v1/admin/resources/orphaned", get(list_orphaned))
        .route("/v1/admin/resources/:name", delete(unregister_resource))
        .route("/v1/admin/participants", get(list_participants))
        .route("/v1/admin/leader", get(get_leader))
        .route("/v1/admin/decision", get(get_decision))
        .route("/v1/admin/rebalance", post(force_rebalance))
        .route("/v1/admin/call/*method", get(call_participants))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(admin))
}

async fn list_resources(State(admin): State<Arc<Admin>>) -> ApiResult<Vec<Resource>> {
    admin
        .registered_resources()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn register_resource(
    State(admin): State<Arc<Admin>>,
    Json(resource): Json<Resource>,
) -> ApiResult<Resource> {
    admin
        .register_resource(&resource)
        .await
        .map(|()| Json(resource))
        .map_err(error_response)
}

async fn unregister_resource(
    State(admin): State<Arc<Admin>>,
    Path(name): Path<String>,
) -> std::result::Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    admin
        .unregister_resource(&name)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

async fn list_orphaned(State(admin): State<Arc<Admin>>) -> ApiResult<Vec<Resource>> {
    admin
        .orphaned_resources()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn list_participants(State(admin): State<Arc<Admin>>) -> ApiResult<Vec<ParticipantResponse>> {
    admin
        .live_participants()
        .await
        .map(|participants| {
            Json(
                participants
                    .into_iter()
                    .map(|p| ParticipantResponse {
                        endpoint: p.endpoint,
                        weight: p.weight,
                    })
                    .collect(),
            )
        })
        .map_err(error_response)
}

async fn get_leader(State(admin): State<Arc<Admin>>) -> ApiResult<LeaderResponse> {
    admin
        .leader()
        .await
        .map(|leader| Json(LeaderResponse { leader }))
        .map_err(error_response)
}

async fn get_decision(State(admin): State<Arc<Admin>>) -> ApiResult<DecisionView> {
    admin.current_decision().map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "no decision published by this node".into(),
            }),
        )
    })
}

async fn force_rebalance(State(admin): State<Arc<Admin>>) -> ApiResult<RebalanceSummary> {
    admin
        .rebalance()
        .await
        .map(|outcome| Json(RebalanceSummary::from(&outcome)))
        .map_err(error_response)
}

async fn call_participants(
    State(admin): State<Arc<Admin>>,
    Path(method): Path<String>,
    RawQuery(query): RawQuery,
) -> ApiResult<CallResponse> {
    let results = admin
        .call_participants(method.trim_start_matches('/'), query.as_deref().unwrap_or(""))
        .await
        .map_err(error_response)?;
    let mut response = CallResponse {
        ok: BTreeMap::new(),
        failed: BTreeMap::new(),
    };
    for (endpoint, result) in results {
        match result {
            Ok(body) => response.ok.insert(endpoint, body),
            Err(reason) => response.failed.insert(endpoint, reason),
        };
    }
    Ok(Json(response))
}
