// src/server/connection_loop.rs

//! Contains the main daemon loop: serving WebSocket upgrades and handling
//! graceful shutdown.

use super::context::ServerContext;
use crate::connection::ConnectionHandler;
use crate::core::state::{DaemonState, ShutdownSummary};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long to wait for background tasks after shutdown before giving up.
const BACKGROUND_TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared with every upgrade request.
#[derive(Clone)]
struct UpgradeState {
    state: Arc<DaemonState>,
    permits: Arc<Semaphore>,
    client_tasks: TaskTracker,
    shutdown_tx: broadcast::Sender<()>,
}

/// Accepts a WebSocket upgrade, or answers 503 when the daemon is full or
/// shutting down.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(app): State<UpgradeState>,
) -> Response {
    if app.state.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Ok(permit) = Arc::clone(&app.permits).try_acquire_owned() else {
        app.state.stats.increment_rejected_connections();
        warn!(
            "Rejecting connection from {}: max_connections ({}) reached.",
            addr, app.state.config.max_connections
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };
    app.state.stats.increment_total_connections();

    let state = app.state;
    let shutdown_rx = app.shutdown_tx.subscribe();
    let client_tasks = app.client_tasks;
    ws.on_upgrade(move |socket| {
        client_tasks.track_future(async move {
            let _permit = permit;
            match ConnectionHandler::accept(socket, addr, state, shutdown_rx) {
                Ok(handler) => {
                    if let Err(e) = handler.run().await {
                        warn!("Connection from {} terminated unexpectedly: {}", addr, e);
                    }
                }
                Err(e) => warn!("Could not register connection from {}: {}", addr, e),
            }
        })
    })
}

/// Runs the daemon until `shutdown` completes or a background task fails,
/// then shuts everything down gracefully.
pub async fn run(
    ctx: ServerContext,
    shutdown: impl Future<Output = ()>,
) -> Result<ShutdownSummary, anyhow::Error> {
    let ServerContext {
        state,
        listener,
        metrics_listener: _,
        shutdown_tx,
        mut background_tasks,
        connection_permits,
        client_tasks,
    } = ctx;

    let app = Router::new()
        .route(&state.config.ws_path, get(ws_upgrade))
        .with_state(UpgradeState {
            state: Arc::clone(&state),
            permits: connection_permits,
            client_tasks: client_tasks.clone(),
            shutdown_tx: shutdown_tx.clone(),
        });
    let mut serve_shutdown_rx = shutdown_tx.subscribe();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            serve_shutdown_rx.recv().await.ok();
        })
        .await
    });
    let mut server_finished = false;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("Shutdown requested, initiating graceful shutdown.");
                break;
            }

            Some(res) = background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            }

            res = &mut server => {
                server_finished = true;
                match res {
                    Ok(Ok(())) => warn!("WebSocket listener stopped unexpectedly."),
                    Ok(Err(e)) => error!("CRITICAL: WebSocket listener failed: {}. Shutting down.", e),
                    Err(e) => error!("CRITICAL: WebSocket listener panicked: {e:?}. Shutting down."),
                }
                break;
            }
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    if shutdown_tx.send(()).is_err() {
        debug!("No task was listening for the shutdown signal.");
    }

    let summary = state.shutdown().await;

    client_tasks.close();
    let grace = state.config.shutdown.grace_period;
    if tokio::time::timeout(grace, client_tasks.wait()).await.is_err() {
        warn!(
            "Timed out waiting for {} connection handlers to finish.",
            client_tasks.len()
        );
    }

    if !server_finished {
        match tokio::time::timeout(grace, &mut server).await {
            Ok(Ok(Err(e))) => warn!("WebSocket listener finished with error: {}", e),
            Ok(Err(e)) => warn!("WebSocket listener task failed: {e:?}"),
            Ok(Ok(Ok(()))) => {}
            Err(_) => {
                warn!("Timed out waiting for the WebSocket listener to stop.");
                server.abort();
            }
        }
    }

    if tokio::time::timeout(BACKGROUND_TASK_TIMEOUT, async {
        while background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    }
    info!(?summary, "Daemon shutdown complete.");
    Ok(summary)
}
