// src/server/metrics_server.rs

use crate::core::state::DaemonState;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles `GET /metrics`: refreshes the gauges, then encodes every
/// registered series in the Prometheus text format.
async fn metrics_handler(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    state.refresh_gauges();
    match state.exporter.gather() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Handles `GET /snapshot`: a JSON view of the daemon's internals.
async fn snapshot_handler(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    Json(state.snapshot())
}

pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/snapshot", get(snapshot_handler))
        .with_state(state)
}

/// Serves `/metrics` and `/snapshot` until shutdown.
pub async fn run_metrics_server(
    state: Arc<DaemonState>,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), anyhow::Error> {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics server listening on http://{}/metrics", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await?;
    Ok(())
}
