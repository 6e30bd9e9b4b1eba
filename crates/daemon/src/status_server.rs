//! Status HTTP Server for the lofi streamer
//!
//! Exposes the current stream status as JSON for monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::status::{collect_system_metrics, timestamp_ms, SharedStatus, StreamStatus};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
/// Returns the current StreamStatus as JSON with fresh system metrics
async fn get_status(State(status): State<SharedStatus>) -> Json<StreamStatus> {
    let mut snapshot = status.read().await.clone();
    snapshot.system = collect_system_metrics();
    snapshot.timestamp_unix_ms = timestamp_ms();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Parse the configured bind address.
pub fn parse_bind_addr(bind: &str) -> Result<SocketAddr, ServerError> {
    bind.trim()
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))
}

/// Runs the status HTTP server until `shutdown` is cancelled
///
/// # Arguments
/// * `status` - Shared status state to serve
/// * `addr` - Address to listen on
/// * `shutdown` - Token that stops the server gracefully
pub async fn run_status_server(
    status: SharedStatus,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_status_router(status);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
