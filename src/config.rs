// src/config.rs

//! Manages daemon configuration: loading, environment overrides, and validation.

use crate::core::router::TimeoutHierarchy;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// The prefix for environment overrides, e.g. `TIDEGATE__SESSION__MAX_SESSIONS=500`.
pub const ENV_PREFIX: &str = "TIDEGATE";

/// What happens to queued outbound frames when a connection is unregistered.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UnregisterPolicy {
    /// Attempt to write every queued frame before closing the socket.
    #[default]
    Drain,
    /// Drop queued frames and close immediately.
    Discard,
}

/// Settings for the per-connection transport layer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of each connection's outbound frame queue.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Maximum number of requests a single connection may have in flight.
    #[serde(default = "default_max_in_flight_requests")]
    pub max_in_flight_requests: usize,
    /// Frames larger than this are rejected without parsing.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub unregister_policy: UnregisterPolicy,
    /// Identical frames seen within this window are suppressed.
    #[serde(default = "default_dedup_window", with = "humantime_serde")]
    pub dedup_window: Duration,
    /// Number of content hashes the deduplicator remembers.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Connections that do not complete a handshake in time are closed.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

fn default_outbound_queue_capacity() -> usize {
    256
}
fn default_max_in_flight_requests() -> usize {
    32
}
fn default_max_frame_bytes() -> usize {
    1024 * 1024 // 1 MiB
}
fn default_dedup_window() -> Duration {
    Duration::from_secs(5)
}
fn default_dedup_capacity() -> usize {
    4096
}
fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_in_flight_requests: default_max_in_flight_requests(),
            max_frame_bytes: default_max_frame_bytes(),
            unregister_policy: UnregisterPolicy::default(),
            dedup_window: default_dedup_window(),
            dedup_capacity: default_dedup_capacity(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

/// Session lifetime and admission limits.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(default = "default_min_ttl", with = "humantime_serde")]
    pub min_ttl: Duration,
    #[serde(default = "default_max_ttl", with = "humantime_serde")]
    pub max_ttl: Duration,
    /// Process-wide cap on live sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_sessions_per_connection")]
    pub max_sessions_per_connection: usize,
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Number of independently locked buckets in the session map.
    #[serde(default = "default_session_shards")]
    pub shards: usize,
    /// If true, a disconnect closes the connection's sessions instead of
    /// leaving them resumable until their TTL runs out.
    #[serde(default)]
    pub close_on_disconnect: bool,
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_min_ttl() -> Duration {
    Duration::from_secs(1)
}
fn default_max_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
fn default_max_sessions() -> usize {
    10_000
}
fn default_max_sessions_per_connection() -> usize {
    16
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_session_shards() -> usize {
    16
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_session_ttl(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            max_sessions: default_max_sessions(),
            max_sessions_per_connection: default_max_sessions_per_connection(),
            sweep_interval: default_sweep_interval(),
            shards: default_session_shards(),
            close_on_disconnect: false,
        }
    }
}

/// The coordinated timeouts of every layer between a handler and the end client.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_handler_timeout", with = "humantime_serde")]
    pub handler: Duration,
    #[serde(default = "default_daemon_timeout", with = "humantime_serde")]
    pub daemon: Duration,
    #[serde(default = "default_transport_shim_timeout", with = "humantime_serde")]
    pub transport_shim: Duration,
    #[serde(default = "default_client_timeout", with = "humantime_serde")]
    pub client: Duration,
}

fn default_handler_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_daemon_timeout() -> Duration {
    Duration::from_secs(45)
}
fn default_transport_shim_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_client_timeout() -> Duration {
    Duration::from_secs(75)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handler: default_handler_timeout(),
            daemon: default_daemon_timeout(),
            transport_shim: default_transport_shim_timeout(),
            client: default_client_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn hierarchy(&self) -> TimeoutHierarchy {
        TimeoutHierarchy {
            handler: self.handler,
            daemon: self.daemon,
            transport_shim: self.transport_shim,
            client: self.client,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a probe.
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff", with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Relative jitter applied to each backoff delay, in `[0, 1)`. `0` disables it.
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_backoff() -> Duration {
    Duration::from_secs(1)
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(4)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            jitter: 0.0,
        }
    }
}

/// Bounds and tuning of the adaptive metrics sampler.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SamplerConfig {
    #[serde(default = "default_base_rate")]
    pub base_rate: f64,
    #[serde(default = "default_min_rate")]
    pub min_rate: f64,
    #[serde(default = "default_max_rate")]
    pub max_rate: f64,
    #[serde(default = "default_adjust_interval", with = "humantime_serde")]
    pub adjust_interval: Duration,
    /// Buffer occupancy above which the rate is lowered.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,
    /// Buffer occupancy below which the rate is raised.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,
}

fn default_base_rate() -> f64 {
    0.03
}
fn default_min_rate() -> f64 {
    0.01
}
fn default_max_rate() -> f64 {
    0.15
}
fn default_adjust_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_high_watermark() -> f64 {
    0.8
}
fn default_low_watermark() -> f64 {
    0.3
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            base_rate: default_base_rate(),
            min_rate: default_min_rate(),
            max_rate: default_max_rate(),
            adjust_interval: default_adjust_interval(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
        }
    }
}

/// Configuration for the metrics collector and the Prometheus exporter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// If true, an HTTP server exposes `/metrics` and `/snapshot`.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(default)]
    pub sampler: SamplerConfig,
}

fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9464
}
fn default_ring_capacity() -> usize {
    2000
}
fn default_flush_interval() -> Duration {
    Duration::from_secs(2)
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
            ring_capacity: default_ring_capacity(),
            flush_interval: default_flush_interval(),
            sampler: SamplerConfig::default(),
        }
    }
}

/// What `enqueue` does when the log queue is full.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowStrategy {
    /// Evict the oldest queued event to make room.
    #[default]
    DropOldest,
    /// Keep the queued history and discard the incoming event.
    DropNewest,
    /// Wait up to `block_timeout` for room, then discard the incoming event.
    BlockWithTimeout,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSinkKind {
    #[default]
    Stderr,
    File,
}

/// Configuration for asynchronous log delivery.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowStrategy,
    #[serde(default = "default_block_timeout", with = "humantime_serde")]
    pub block_timeout: Duration,
    /// Every n-th non-critical event per sample key is emitted.
    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,
    /// Per-key overrides of `sample_interval`.
    #[serde(default)]
    pub sample_intervals: HashMap<String, u64>,
    #[serde(default = "default_sampler_max_keys")]
    pub sampler_max_keys: usize,
    /// Per-key counters wrap back to zero after this many increments.
    #[serde(default = "default_counter_reset")]
    pub counter_reset: u64,
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,
    #[serde(default = "default_drain_interval", with = "humantime_serde")]
    pub drain_interval: Duration,
    #[serde(default)]
    pub sink: LogSinkKind,
    #[serde(default)]
    pub file_path: Option<String>,
}

fn default_log_queue_capacity() -> usize {
    10_000
}
fn default_block_timeout() -> Duration {
    Duration::from_millis(20)
}
fn default_sample_interval() -> u64 {
    10
}
fn default_sampler_max_keys() -> usize {
    1000
}
fn default_counter_reset() -> u64 {
    1_000_000
}
fn default_drain_batch() -> usize {
    512
}
fn default_drain_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_log_queue_capacity(),
            overflow: OverflowStrategy::default(),
            block_timeout: default_block_timeout(),
            sample_interval: default_sample_interval(),
            sample_intervals: HashMap::new(),
            sampler_max_keys: default_sampler_max_keys(),
            counter_reset: default_counter_reset(),
            drain_batch: default_drain_batch(),
            drain_interval: default_drain_interval(),
            sink: LogSinkKind::default(),
            file_path: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound on the time spent flushing queues during shutdown.
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
        }
    }
}

/// The validated daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7979
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_connections() -> usize {
    10_000
}
fn default_ws_path() -> String {
    "/ws".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_connections: default_max_connections(),
            ws_path: default_ws_path(),
            connection: ConnectionConfig::default(),
            session: SessionConfig::default(),
            timeouts: TimeoutConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            metrics: MetricsConfig::default(),
            log: LogConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Config {
    /// Loads a TOML file, applies `TIDEGATE__*` environment overrides, and validates.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::new(path, ::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config file at '{path}'"))?;

        let config: Config = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse configuration from '{path}'"))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration. Any inconsistency is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections cannot be 0"));
        }
        if !self.ws_path.starts_with('/') {
            return Err(anyhow!("ws_path must start with '/'"));
        }

        let conn = &self.connection;
        if conn.outbound_queue_capacity == 0 {
            return Err(anyhow!("connection.outbound_queue_capacity cannot be 0"));
        }
        if conn.max_in_flight_requests == 0 {
            return Err(anyhow!("connection.max_in_flight_requests cannot be 0"));
        }
        if conn.max_frame_bytes == 0 {
            return Err(anyhow!("connection.max_frame_bytes cannot be 0"));
        }
        if conn.dedup_capacity == 0 {
            return Err(anyhow!("connection.dedup_capacity cannot be 0"));
        }

        let session = &self.session;
        if session.min_ttl.is_zero() {
            return Err(anyhow!("session.min_ttl cannot be 0"));
        }
        if session.min_ttl > session.max_ttl {
            return Err(anyhow!("session.min_ttl cannot exceed session.max_ttl"));
        }
        if session.default_ttl < session.min_ttl || session.default_ttl > session.max_ttl {
            return Err(anyhow!(
                "session.default_ttl must lie between session.min_ttl and session.max_ttl"
            ));
        }
        if session.max_sessions == 0 || session.max_sessions_per_connection == 0 {
            return Err(anyhow!("session limits cannot be 0"));
        }
        if session.max_sessions_per_connection > session.max_sessions {
            warn!(
                "session.max_sessions_per_connection ({}) exceeds session.max_sessions ({}).",
                session.max_sessions_per_connection, session.max_sessions
            );
        }
        if session.sweep_interval.is_zero() {
            return Err(anyhow!("session.sweep_interval cannot be 0"));
        }
        if session.shards == 0 {
            return Err(anyhow!("session.shards cannot be 0"));
        }

        self.timeouts
            .hierarchy()
            .validate()
            .map_err(|e| anyhow!("invalid [timeouts]: {e}"))?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(anyhow!("circuit_breaker.failure_threshold cannot be 0"));
        }
        if self.circuit_breaker.recovery_timeout.is_zero() {
            return Err(anyhow!("circuit_breaker.recovery_timeout cannot be 0"));
        }

        if self.retry.max_backoff < self.retry.base_backoff {
            return Err(anyhow!("retry.max_backoff cannot be below retry.base_backoff"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(anyhow!("retry.jitter must be in [0, 1)"));
        }

        let metrics = &self.metrics;
        if metrics.ring_capacity == 0 {
            return Err(anyhow!("metrics.ring_capacity cannot be 0"));
        }
        if metrics.flush_interval.is_zero() {
            return Err(anyhow!("metrics.flush_interval cannot be 0"));
        }
        let s = &metrics.sampler;
        if !(s.min_rate > 0.0 && s.min_rate <= s.base_rate && s.base_rate <= s.max_rate && s.max_rate <= 1.0)
        {
            return Err(anyhow!(
                "metrics.sampler rates must satisfy 0 < min_rate <= base_rate <= max_rate <= 1"
            ));
        }
        if !(0.0 <= s.low_watermark && s.low_watermark < s.high_watermark && s.high_watermark <= 1.0)
        {
            return Err(anyhow!(
                "metrics.sampler watermarks must satisfy 0 <= low_watermark < high_watermark <= 1"
            ));
        }
        if s.adjust_interval.is_zero() {
            return Err(anyhow!("metrics.sampler.adjust_interval cannot be 0"));
        }
        if metrics.enabled {
            if metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }

        let log = &self.log;
        if log.queue_capacity == 0 {
            return Err(anyhow!("log.queue_capacity cannot be 0"));
        }
        if log.sample_interval == 0 || log.sample_intervals.values().any(|v| *v == 0) {
            return Err(anyhow!("log sample intervals cannot be 0"));
        }
        if log.sampler_max_keys == 0 {
            return Err(anyhow!("log.sampler_max_keys cannot be 0"));
        }
        if log.counter_reset < log.sample_interval {
            return Err(anyhow!("log.counter_reset cannot be below log.sample_interval"));
        }
        if log.drain_batch == 0 {
            return Err(anyhow!("log.drain_batch cannot be 0"));
        }
        if log.drain_interval.is_zero() {
            return Err(anyhow!("log.drain_interval cannot be 0"));
        }
        if log.sink == LogSinkKind::File
            && log.file_path.as_deref().is_none_or(|p| p.trim().is_empty())
        {
            return Err(anyhow!("log.file_path is required when log.sink = \"file\""));
        }
        Ok(())
    }
}
