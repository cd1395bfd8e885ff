// src/core/state/core.rs

//! Defines the central `DaemonState` struct, which owns every component of a
//! running daemon and wires them together once at startup.

use super::stats::{StatsSnapshot, StatsState};
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionStats};
use crate::core::DaemonError;
use crate::core::resilience::{BreakerSnapshot, CircuitBreakerRegistry, RetryExecutor};
use crate::core::router::{HandlerRegistry, RequestRouter, register_builtin};
use crate::core::session::{CloseReason, LivenessProbe, SessionManager, SessionStats};
use crate::core::telemetry::{
    AggregatedMetrics, AsyncLogDelivery, CollectorStats, DaemonMetrics, DeliveryStats,
    MetricsCollector, PrometheusPublisher,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::info;

const IN_FLIGHT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The shared state of one daemon instance. Components are created here and
/// handed to each other explicitly; nothing is reached through a global.
pub struct DaemonState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionManager>,
    pub sessions: Arc<SessionManager>,
    pub router: Arc<RequestRouter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub metrics: Arc<MetricsCollector>,
    pub exporter: Arc<DaemonMetrics>,
    pub logs: Arc<AsyncLogDelivery>,
    pub stats: StatsState,
    /// Set by the first `shutdown` call; later callers get the same report.
    shutdown_report: OnceCell<ShutdownSummary>,
}

/// What a graceful shutdown accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    /// Outbound frames written during the grace period.
    pub flushed: u64,
    /// Outbound frames discarded when the grace period ran out.
    pub dropped: u64,
    /// Connections closed.
    pub closed: u64,
    pub requests_cancelled: u64,
    pub sessions_closed: u64,
    pub log_lines_written: u64,
    pub log_lines_dropped: u64,
}

/// The JSON document served on `/snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonSnapshot {
    pub version: &'static str,
    pub shutting_down: bool,
    pub connections: ConnectionStats,
    pub sessions: SessionStats,
    pub in_flight_requests: usize,
    pub breakers: Vec<BreakerSnapshot>,
    pub metrics: CollectorStats,
    pub latest_aggregate: Option<AggregatedMetrics>,
    pub logs: DeliveryStats,
    pub transport: StatsSnapshot,
}

impl DaemonState {
    /// Builds every component from `config` with the built-in handlers
    /// registered.
    pub fn initialize(
        config: Config,
        metrics: Arc<MetricsCollector>,
        logs: Arc<AsyncLogDelivery>,
    ) -> Result<Arc<Self>, DaemonError> {
        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry);
        Self::with_handlers(config, metrics, logs, registry)
    }

    /// Like `initialize`, with a caller-supplied handler registry.
    pub fn with_handlers(
        config: Config,
        metrics: Arc<MetricsCollector>,
        logs: Arc<AsyncLogDelivery>,
        registry: HandlerRegistry,
    ) -> Result<Arc<Self>, DaemonError> {
        config
            .validate()
            .map_err(|e| DaemonError::Config(e.to_string()))?;
        let config = Arc::new(config);

        let exporter = Arc::new(DaemonMetrics::new()?);
        let connections = Arc::new(ConnectionManager::new(
            &config.connection,
            Some(Arc::clone(&metrics)),
        ));
        let liveness: Arc<dyn LivenessProbe> = connections.clone();
        let sessions = Arc::new(SessionManager::new(
            &config.session,
            Some(liveness),
            Some(Arc::clone(&metrics)),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            &config.circuit_breaker,
            Some(Arc::clone(&metrics)),
        ));
        let executor = RetryExecutor::new(Arc::clone(&breakers), Some(Arc::clone(&metrics)));
        let router = Arc::new(RequestRouter::new(
            Arc::clone(&sessions),
            executor,
            registry,
            config.timeouts.hierarchy(),
            &config.retry,
            Some(Arc::clone(&metrics)),
        )?);

        info!(
            methods = ?router.registry().methods(),
            "Daemon state initialized."
        );

        Ok(Arc::new(Self {
            config,
            connections,
            sessions,
            router,
            breakers,
            metrics,
            exporter,
            logs,
            stats: StatsState::new(),
            shutdown_report: OnceCell::new(),
        }))
    }

    /// Pushes live gauge values into the Prometheus registry.
    pub fn refresh_gauges(&self) {
        let exporter = &self.exporter;
        exporter.connections_open.set(self.connections.len() as i64);
        exporter.sessions_active.set(self.sessions.len() as i64);
        exporter.log_queue_depth.set(self.logs.queue_depth() as i64);
        exporter.sample_rate.set(self.metrics.sample_rate());
        exporter
            .metrics_ring_occupancy
            .set(self.metrics.resident() as f64 / self.metrics.capacity().max(1) as f64);
        for breaker in self.breakers.snapshot() {
            exporter
                .circuit_state
                .with_label_values(&[breaker.operation.as_str()])
                .set(breaker.state.as_gauge());
        }
    }

    pub fn snapshot(&self) -> DaemonSnapshot {
        DaemonSnapshot {
            version: crate::VERSION,
            shutting_down: self.router.is_shutting_down(),
            connections: self.connections.stats(),
            sessions: self.sessions.stats(),
            in_flight_requests: self.router.in_flight(),
            breakers: self.breakers.snapshot(),
            metrics: self.metrics.stats(),
            latest_aggregate: self.metrics.latest(),
            logs: self.logs.stats(),
            transport: self.stats.snapshot(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.router.is_shutting_down()
    }

    /// Shuts the daemon down gracefully and returns what was flushed, dropped
    /// and closed. Only the first call does any work; concurrent and later
    /// calls wait for it and receive the same summary.
    ///
    /// Order: refuse new requests and let dispatched ones finish, then drain
    /// outbound queues and close every connection, all within the grace
    /// period. After that, cancel what is still running, close sessions,
    /// publish the final metrics aggregate and flush the log queue with
    /// whatever is left of the grace period.
    pub async fn shutdown(&self) -> ShutdownSummary {
        *self
            .shutdown_report
            .get_or_init(|| self.shutdown_inner())
            .await
    }

    async fn shutdown_inner(&self) -> ShutdownSummary {
        let grace = self.config.shutdown.grace_period;
        let started = Instant::now();
        info!(?grace, "Graceful shutdown started.");

        self.router.begin_shutdown();
        // Requests already dispatched may still answer within the grace period.
        let deadline = started + grace;
        while self.router.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(IN_FLIGHT_POLL_INTERVAL).await;
        }
        let report = self
            .connections
            .shutdown_all(deadline.saturating_duration_since(Instant::now()))
            .await;
        let requests_cancelled = self.router.cancel_all() as u64;
        let sessions_closed = self.sessions.close_all(CloseReason::Shutdown) as u64;

        let publisher = PrometheusPublisher::new(Arc::clone(&self.exporter));
        self.metrics.flush_to(&publisher);
        self.refresh_gauges();
        info!(
            flushed = report.flushed,
            dropped = report.dropped,
            closed = report.closed,
            requests_cancelled,
            sessions_closed,
            elapsed = ?started.elapsed(),
            "Connections and sessions closed; flushing logs."
        );

        // The log queue always gets a moment, even if the connections used up
        // the whole grace period. Nothing logged after this point is delivered.
        let remaining = grace
            .saturating_sub(started.elapsed())
            .max(Duration::from_millis(100));
        let (log_lines_written, log_lines_dropped) = self.logs.drain_all(remaining);

        ShutdownSummary {
            flushed: report.flushed,
            dropped: report.dropped,
            closed: report.closed,
            requests_cancelled,
            sessions_closed,
            log_lines_written,
            log_lines_dropped,
        }
    }
}
