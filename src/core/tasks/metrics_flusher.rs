// src/core/tasks/metrics_flusher.rs

use crate::core::state::DaemonState;
use crate::core::telemetry::PrometheusPublisher;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Aggregates the metrics ring on a fixed interval and publishes the result
/// to the Prometheus registry. Gauges are refreshed on the same tick.
pub struct MetricsFlusher {
    state: Arc<DaemonState>,
}

impl MetricsFlusher {
    pub fn new(state: Arc<DaemonState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.state.config.metrics.flush_interval;
        info!("Metrics flusher started. Interval: {:?}", period);
        let publisher = PrometheusPublisher::new(Arc::clone(&self.state.exporter));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and the ring is still empty.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let aggregate = self.state.metrics.flush_to(&publisher);
                    self.state.refresh_gauges();
                    debug!(
                        types = aggregate.aggregates.len(),
                        sample_rate = aggregate.sample_rate,
                        "Metrics flushed."
                    );
                }
                _ = shutdown_rx.recv() => {
                    // The final flush belongs to the shutdown sequence.
                    info!("Metrics flusher shutting down.");
                    return;
                }
            }
        }
    }
}
