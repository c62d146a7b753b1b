//! HTTP plumbing shared by the participant and admin routers

use axum::{http::StatusCode, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{KeelError, Result};
use crate::runtime::ShutdownSignal;

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Convert a [`KeelError`] into a status and JSON body
pub fn error_response(e: KeelError) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

/// Serve `router` on `listener` until `shutdown` fires
pub async fn serve(listener: TcpListener, router: Router, shutdown: ShutdownSignal) -> Result<()> {
    let addr = listener.local_addr().ok();
    info!("HTTP API listening on {:?}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(|e| KeelError::Internal {
            message: format!("HTTP server on {:?} failed: {}", addr, e),
        })
}
