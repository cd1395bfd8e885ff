// src/server/spawner.rs

//! Spawns all of the daemon's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::tasks::{LogDrainer, MetricsFlusher, SessionSweeper};
use std::sync::Arc;
use tracing::info;

/// Spawns all background tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext) {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    // --- Metrics Server ---
    if let Some(listener) = ctx.metrics_listener.take() {
        let metrics_state = Arc::clone(state);
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, listener, shutdown_rx_metrics).await
        });
    } else {
        info!("Metrics server is disabled in the configuration.");
    }

    // --- Maintenance Tasks ---
    let sweeper = SessionSweeper::new(Arc::clone(&state.sessions));
    let shutdown_rx_sweep = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        sweeper.run(shutdown_rx_sweep).await;
        Ok(())
    });

    let flusher = MetricsFlusher::new(Arc::clone(state));
    let shutdown_rx_flush = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        flusher.run(shutdown_rx_flush).await;
        Ok(())
    });

    let drainer = LogDrainer::new(Arc::clone(&state.logs), state.config.log.drain_interval);
    let shutdown_rx_drain = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        drainer.run(shutdown_rx_drain).await;
        Ok(())
    });

    info!("All background tasks have been spawned.");
}
