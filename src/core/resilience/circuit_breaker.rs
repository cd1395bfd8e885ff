// src/core/resilience/circuit_breaker.rs

//! Per-operation circuit breakers.
//!
//! Each operation name owns one breaker with the usual three states:
//!
//! - `Closed`: calls pass. `failure_threshold` consecutive failures open it.
//! - `Open`: calls are rejected with `CircuitOpen` until `recovery_timeout`
//!   has elapsed. The transition out of `Open` is evaluated lazily by the
//!   next caller, not by a timer.
//! - `HalfOpen`: exactly one probe call is admitted. Success closes the
//!   breaker; failure reopens it and restarts the recovery clock. Other
//!   callers are rejected while the probe runs.

use crate::config::CircuitBreakerConfig;
use crate::core::DaemonError;
use crate::core::telemetry::{MetricSample, MetricType, MetricsCollector};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Retry hint given to callers rejected while a half-open probe is running.
const HALF_OPEN_RETRY_HINT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for gauges.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    times_opened: u64,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            times_opened: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.times_opened += 1;
    }
}

/// A point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub times_opened: u64,
    /// Time left before an open breaker admits a probe.
    pub retry_after_ms: Option<u64>,
}

/// All circuit breakers of the process, keyed by operation name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<Mutex<BreakerCore>>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: &CircuitBreakerConfig, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            metrics,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    fn core(&self, operation: &str) -> Arc<Mutex<BreakerCore>> {
        if let Some(core) = self.breakers.get(operation) {
            return Arc::clone(core.value());
        }
        Arc::clone(
            self.breakers
                .entry(operation.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerCore::new())))
                .value(),
        )
    }

    /// Asks to make one call to `operation`.
    ///
    /// Returns a permit that must be settled with `success` or `failure`. A
    /// permit dropped unsettled releases its probe slot without changing state.
    pub fn try_acquire(&self, operation: &str) -> Result<CallPermit, DaemonError> {
        let core = self.core(operation);
        let now = Instant::now();
        let admission = {
            let mut guard = core.lock();
            match guard.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let opened_at = guard.opened_at.unwrap_or(now);
                    let elapsed = now.saturating_duration_since(opened_at);
                    if elapsed >= self.recovery_timeout {
                        guard.state = CircuitState::HalfOpen;
                        guard.probe_in_flight = true;
                        Ok(true)
                    } else {
                        Err(self.recovery_timeout - elapsed)
                    }
                }
                CircuitState::HalfOpen => {
                    if guard.probe_in_flight {
                        Err(HALF_OPEN_RETRY_HINT)
                    } else {
                        guard.probe_in_flight = true;
                        Ok(true)
                    }
                }
            }
        };

        match admission {
            Ok(probe) => {
                if probe {
                    info!(operation, "Circuit half-open; admitting a probe call.");
                }
                Ok(CallPermit {
                    core,
                    operation: operation.to_string(),
                    probe,
                    settled: false,
                    failure_threshold: self.failure_threshold,
                    metrics: self.metrics.clone(),
                })
            }
            Err(retry_after) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record(MetricSample::count(MetricType::CircuitRejected));
                }
                Err(DaemonError::CircuitOpen {
                    operation: operation.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// The stored state of `operation`. An open breaker whose recovery
    /// timeout has passed still reports `Open` until a caller arrives.
    pub fn state(&self, operation: &str) -> CircuitState {
        self.breakers
            .get(operation)
            .map_or(CircuitState::Closed, |core| core.lock().state)
    }

    pub fn consecutive_failures(&self, operation: &str) -> u32 {
        self.breakers
            .get(operation)
            .map_or(0, |core| core.lock().consecutive_failures)
    }

    /// Forces a breaker back to `Closed`.
    pub fn reset(&self, operation: &str) {
        if let Some(core) = self.breakers.get(operation) {
            *core.lock() = BreakerCore::new();
        }
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut breakers: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| {
                let core = entry.value().lock();
                let retry_after_ms = match (core.state, core.opened_at) {
                    (CircuitState::Open, Some(opened_at)) => Some(
                        self.recovery_timeout
                            .saturating_sub(now.saturating_duration_since(opened_at))
                            .as_millis() as u64,
                    ),
                    _ => None,
                };
                BreakerSnapshot {
                    operation: entry.key().clone(),
                    state: core.state,
                    consecutive_failures: core.consecutive_failures,
                    times_opened: core.times_opened,
                    retry_after_ms,
                }
            })
            .collect();
        breakers.sort_by(|a, b| a.operation.cmp(&b.operation));
        breakers
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| entry.value().lock().state != CircuitState::Closed)
            .count()
    }
}

/// Permission to make one call through a breaker.
pub struct CallPermit {
    core: Arc<Mutex<BreakerCore>>,
    operation: String,
    probe: bool,
    settled: bool,
    failure_threshold: u32,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CallPermit {
    /// True if this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Any success resets the failure count and closes the breaker.
    pub fn success(mut self) {
        self.settled = true;
        let previous = {
            let mut core = self.core.lock();
            let previous = core.state;
            core.state = CircuitState::Closed;
            core.consecutive_failures = 0;
            core.opened_at = None;
            core.probe_in_flight = false;
            previous
        };
        if previous != CircuitState::Closed {
            info!(operation = %self.operation, "Circuit closed after a successful call.");
        }
    }

    /// Counts a failure. Returns true if this failure opened the breaker.
    pub fn failure(mut self) -> bool {
        self.settled = true;
        let now = Instant::now();
        let (opened, failures) = {
            let mut core = self.core.lock();
            core.consecutive_failures = core.consecutive_failures.saturating_add(1);
            let opened = match core.state {
                CircuitState::HalfOpen => {
                    core.open(now);
                    true
                }
                CircuitState::Closed if core.consecutive_failures >= self.failure_threshold => {
                    core.open(now);
                    true
                }
                _ => false,
            };
            (opened, core.consecutive_failures)
        };
        if opened {
            warn!(
                operation = %self.operation,
                consecutive_failures = failures,
                probe = self.probe,
                "Circuit opened."
            );
            if let Some(metrics) = &self.metrics {
                metrics.record(MetricSample::count(MetricType::CircuitOpened));
            }
        }
        opened
    }

    /// Settles the call without affecting the breaker, e.g. for a request the
    /// caller rejected before it reached the upstream.
    pub fn release(mut self) {
        self.settled = true;
        if self.probe {
            self.core.lock().probe_in_flight = false;
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.core.lock().probe_in_flight = false;
        }
    }
}
