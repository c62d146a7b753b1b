//! Participant HTTP API
//!
//! Decision RPC endpoint plus local inspection and pipeline control.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::state::{ApplyOutcome, AssignmentReceiver};
use crate::coordinator::distributor::{PushAccepted, PushRejected};
use crate::coordinator::registry::Resource;
use crate::http::{error_response, ErrorResponse};
use crate::metrics::gather_system_metrics;

#[derive(Debug, Deserialize)]
struct EpochQuery {
    epoch: i64,
}

#[derive(Serialize)]
struct AssignmentResponse {
    endpoint: String,
    held_epoch: i64,
    resources: Vec<Resource>,
}

#[derive(Serialize)]
struct PipelineResponse {
    consumers: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Build the participant router
pub fn router(receiver: Arc<AssignmentReceiver>) -> Router {
    Router::new()
        .route("/v1/rebalance", post(rebalance_handler))
        .route("/v1/assignment", get(assignment_handler))
        .route("/v1/pause", post(pause_handler))
        .route("/v1/resume", post(resume_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(receiver)
}

async fn rebalance_handler(
    State(receiver): State<Arc<AssignmentReceiver>>,
    Query(query): Query<EpochQuery>,
    Json(resources): Json<Vec<Resource>>,
) -> Response {
    match receiver.apply(query.epoch, resources).await {
        Ok(ApplyOutcome::Accepted { .. }) => (
            StatusCode::OK,
            Json(PushAccepted {
                accepted: true,
                epoch: query.epoch,
            }),
        )
            .into_response(),
        Ok(ApplyOutcome::Rejected { held_epoch }) => (
            StatusCode::CONFLICT,
            Json(PushRejected {
                error: "leader moved".into(),
                held_epoch,
            }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn assignment_handler(
    State(receiver): State<Arc<AssignmentReceiver>>,
) -> Json<AssignmentResponse> {
    Json(AssignmentResponse {
        endpoint: receiver.endpoint().to_string(),
        held_epoch: receiver.held_epoch().await,
        resources: receiver.owned().await,
    })
}

async fn pause_handler(
    State(receiver): State<Arc<AssignmentReceiver>>,
) -> Result<Json<PipelineResponse>, (StatusCode, Json<ErrorResponse>)> {
    receiver
        .pause()
        .await
        .map(|consumers| Json(PipelineResponse { consumers }))
        .map_err(error_response)
}

async fn resume_handler(
    State(receiver): State<Arc<AssignmentReceiver>>,
) -> Result<Json<PipelineResponse>, (StatusCode, Json<ErrorResponse>)> {
    receiver
        .resume()
        .await
        .map(|consumers| Json(PipelineResponse { consumers }))
        .map_err(error_response)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_handler() -> String {
    gather_system_metrics()
}
