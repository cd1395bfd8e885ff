// src/core/telemetry/exporter.rs

//! Prometheus export. The registry belongs to the daemon instance, so tests
//! and multiple daemons in one process never collide on metric names.

use super::collector::{AggregatedMetrics, MetricsPublisher};
use crate::core::DaemonError;
use prometheus::{CounterVec, Gauge, GaugeVec, IntGauge, Opts, Registry, TextEncoder};

/// The daemon's Prometheus registry and the series it exposes.
pub struct DaemonMetrics {
    registry: Registry,

    // --- Estimated event series, fed from each flush ---
    /// Estimated number of events, labeled by metric type.
    pub events_total: CounterVec,
    /// Estimated sum of event values, labeled by metric type.
    pub event_values_total: CounterVec,

    // --- Gauges refreshed by the flusher ---
    pub connections_open: IntGauge,
    pub sessions_active: IntGauge,
    pub sample_rate: Gauge,
    pub metrics_ring_occupancy: Gauge,
    pub log_queue_depth: IntGauge,
    /// 0 = closed, 1 = half-open, 2 = open; labeled by operation.
    pub circuit_state: GaugeVec,
}

impl DaemonMetrics {
    pub fn new() -> Result<Self, DaemonError> {
        let registry = Registry::new_custom(Some("tidegate".to_string()), None)
            .map_err(prometheus_error)?;

        let events_total = CounterVec::new(
            Opts::new("events_total", "Estimated number of events, corrected for sampling."),
            &["type"],
        )
        .map_err(prometheus_error)?;
        let event_values_total = CounterVec::new(
            Opts::new(
                "event_values_total",
                "Estimated sum of event values, corrected for sampling.",
            ),
            &["type"],
        )
        .map_err(prometheus_error)?;
        let connections_open =
            IntGauge::new("connections_open", "Number of currently registered connections.")
                .map_err(prometheus_error)?;
        let sessions_active = IntGauge::new("sessions_active", "Number of live sessions.")
            .map_err(prometheus_error)?;
        let sample_rate = Gauge::new("metrics_sample_rate", "Current adaptive sample rate.")
            .map_err(prometheus_error)?;
        let metrics_ring_occupancy = Gauge::new(
            "metrics_ring_occupancy",
            "Fraction of the metrics ring buffer in use at the last flush.",
        )
        .map_err(prometheus_error)?;
        let log_queue_depth =
            IntGauge::new("log_queue_depth", "Log events waiting for delivery.")
                .map_err(prometheus_error)?;
        let circuit_state = GaugeVec::new(
            Opts::new(
                "circuit_state",
                "Circuit breaker state per operation (0 closed, 1 half-open, 2 open).",
            ),
            &["operation"],
        )
        .map_err(prometheus_error)?;

        registry
            .register(Box::new(events_total.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(event_values_total.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(connections_open.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(sessions_active.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(sample_rate.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(metrics_ring_occupancy.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(log_queue_depth.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(circuit_state.clone()))
            .map_err(prometheus_error)?;

        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))
            .map_err(prometheus_error)?;

        Ok(Self {
            registry,
            events_total,
            event_values_total,
            connections_open,
            sessions_active,
            sample_rate,
            metrics_ring_occupancy,
            log_queue_depth,
            circuit_state,
        })
    }

    /// Gathers all registered metrics and encodes them in the Prometheus text format.
    pub fn gather(&self) -> Result<String, DaemonError> {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .map_err(prometheus_error)
    }
}

fn prometheus_error(e: prometheus::Error) -> DaemonError {
    DaemonError::Internal(format!("prometheus: {e}"))
}

/// Publishes flush aggregates as Prometheus counters.
pub struct PrometheusPublisher {
    metrics: std::sync::Arc<DaemonMetrics>,
}

impl PrometheusPublisher {
    pub fn new(metrics: std::sync::Arc<DaemonMetrics>) -> Self {
        Self { metrics }
    }
}

impl MetricsPublisher for PrometheusPublisher {
    fn publish(&self, metrics: &AggregatedMetrics) -> Result<(), DaemonError> {
        for (metric_type, aggregate) in &metrics.aggregates {
            let label = [metric_type.as_str()];
            self.metrics
                .events_total
                .get_metric_with_label_values(&label)
                .map_err(prometheus_error)?
                .inc_by(aggregate.estimated_count.max(0.0));
            self.metrics
                .event_values_total
                .get_metric_with_label_values(&label)
                .map_err(prometheus_error)?
                .inc_by(aggregate.estimated_sum.max(0.0));
        }
        self.metrics.sample_rate.set(metrics.sample_rate);
        Ok(())
    }
}
