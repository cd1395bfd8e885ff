// src/server/initialization.rs

//! Handles daemon initialization: building the shared state and binding the
//! listeners.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::router::{HandlerRegistry, register_builtin};
use crate::core::state::DaemonState;
use crate::core::telemetry::{AsyncLogDelivery, MetricsCollector};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Initializes all daemon components and binds the configured ports.
pub async fn setup(
    config: Config,
    metrics: Arc<MetricsCollector>,
    logs: Arc<AsyncLogDelivery>,
) -> Result<ServerContext> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    let metrics_listener = if config.metrics.enabled {
        let listener = TcpListener::bind((config.host.as_str(), config.metrics.port))
            .await
            .with_context(|| {
                format!(
                    "Failed to bind metrics server on {}:{}",
                    config.host, config.metrics.port
                )
            })?;
        Some(listener)
    } else {
        None
    };
    let mut handlers = HandlerRegistry::new();
    register_builtin(&mut handlers);
    setup_with_listeners(config, metrics, logs, handlers, listener, metrics_listener)
}

/// Like `setup`, with listeners the caller already bound and a caller-supplied
/// handler registry.
pub fn setup_with_listeners(
    config: Config,
    metrics: Arc<MetricsCollector>,
    logs: Arc<AsyncLogDelivery>,
    handlers: HandlerRegistry,
    listener: TcpListener,
    metrics_listener: Option<TcpListener>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);
    let connection_permits = Arc::new(Semaphore::new(config.max_connections));

    let state = DaemonState::with_handlers(config, metrics, logs, handlers)
        .context("Failed to initialize daemon state")?;

    let addr = listener.local_addr()?;
    info!(
        "Tidegate listening on ws://{}{}",
        addr, state.config.ws_path
    );

    Ok(ServerContext {
        state,
        listener,
        metrics_listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        connection_permits,
        client_tasks: TaskTracker::new(),
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    let timeouts = &config.timeouts;
    info!(
        handler = ?timeouts.handler,
        daemon = ?timeouts.daemon,
        transport_shim = ?timeouts.transport_shim,
        client = ?timeouts.client,
        "Timeout hierarchy."
    );
    info!(
        "Circuit breakers open after {} consecutive failures and probe again after {:?}.",
        config.circuit_breaker.failure_threshold, config.circuit_breaker.recovery_timeout
    );
    info!(
        "Limits: {} connections, {} sessions ({} per connection), {} in-flight requests per connection.",
        config.max_connections,
        config.session.max_sessions,
        config.session.max_sessions_per_connection,
        config.connection.max_in_flight_requests
    );
}
