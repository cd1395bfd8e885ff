// src/server/context.rs

use crate::core::state::DaemonState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;

/// Holds all the initialized state required to run the daemon's main loop.
pub struct ServerContext {
    pub state: Arc<DaemonState>,
    pub listener: TcpListener,
    /// Bound only when the metrics endpoint is enabled.
    pub metrics_listener: Option<TcpListener>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    /// One permit per open WebSocket, sized by `max_connections`.
    pub connection_permits: Arc<Semaphore>,
    /// Tracks every connection handler task.
    pub client_tasks: TaskTracker,
}
