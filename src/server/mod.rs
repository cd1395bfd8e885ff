// src/server/mod.rs

use crate::config::Config;
use crate::core::state::{DaemonState, ShutdownSummary};
use crate::core::telemetry::{AsyncLogDelivery, MetricsCollector};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

mod connection_loop;
mod context;
mod initialization;
pub mod metrics_server;
mod spawner;

pub use context::ServerContext;
pub use initialization::{setup, setup_with_listeners};

/// The main daemon startup function, orchestrating all setup phases. Returns
/// once a shutdown signal has been handled.
pub async fn run(
    config: Config,
    metrics: Arc<MetricsCollector>,
    logs: Arc<AsyncLogDelivery>,
) -> Result<ShutdownSummary> {
    // 1. Build the daemon state and bind the listeners.
    let mut ctx = initialization::setup(config, metrics, logs).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut ctx);

    // 3. Serve connections until a signal arrives.
    connection_loop::run(ctx, shutdown_signal()).await
}

/// Starts a daemon on already-bound listeners and returns a handle to it.
pub fn spawn(mut ctx: ServerContext) -> Result<ServerHandle> {
    let addr = ctx.listener.local_addr()?;
    let metrics_addr = match &ctx.metrics_listener {
        Some(listener) => Some(listener.local_addr()?),
        None => None,
    };
    let state = Arc::clone(&ctx.state);
    spawner::spawn_all(&mut ctx);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(connection_loop::run(ctx, async move {
        stop_rx.await.ok();
    }));
    Ok(ServerHandle {
        addr,
        metrics_addr,
        state,
        stop_tx,
        task,
    })
}

/// A running daemon started with `spawn`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub state: Arc<DaemonState>,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<ShutdownSummary>>,
}

impl ServerHandle {
    /// Triggers a graceful shutdown and waits for it to finish.
    pub async fn shutdown(self) -> Result<ShutdownSummary> {
        // The loop may already have stopped on its own.
        let _ = self.stop_tx.send(());
        self.task.await?
    }
}

/// Completes on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("SIGINT received.");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received.");
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
