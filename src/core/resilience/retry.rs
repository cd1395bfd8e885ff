// src/core/resilience/retry.rs

//! Bounded retries with exponential backoff, guarded by the circuit breaker.

use super::circuit_breaker::CircuitBreakerRegistry;
use crate::config::RetryConfig;
use crate::core::DaemonError;
use crate::core::telemetry::{MetricSample, MetricType, MetricsCollector};
use futures::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A substitute result used when the primary cannot produce one.
pub type Fallback<T> =
    Box<dyn FnOnce(DaemonError) -> BoxFuture<'static, Result<T, DaemonError>> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` means a single attempt.
    pub max_retries: u32,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Relative jitter in `[0, 1)`. `0` keeps delays exact.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            max_retries: config.max_retries,
            attempt_timeout,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
            jitter: config.jitter,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn single_attempt(attempt_timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            attempt_timeout,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry + 1`: `base * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        let delay = self
            .base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0)).min(self.max_backoff)
    }
}

/// Observes attempts made by `RetryExecutor::run`.
pub trait RetryListener: Send + Sync {
    /// Called before each attempt; `attempt` starts at 0.
    fn on_attempt(&self, _attempt: u32) {}
    /// Called before sleeping ahead of retry number `retry` (starting at 1).
    fn on_retry(&self, _retry: u32, _delay: Duration, _error: &DaemonError) {}
}

/// A listener that ignores everything.
pub struct NoopListener;

impl RetryListener for NoopListener {}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RetryExecutor {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self { breakers, metrics }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Runs `primary` with retries and no fallback.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        primary: F,
    ) -> Result<T, DaemonError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DaemonError>>,
    {
        self.run(operation, policy, None, primary, None, &NoopListener)
            .await
    }

    /// Runs `primary` with retries; `fallback` answers when the breaker is
    /// open or retries are exhausted.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        primary: F,
        fallback: Option<Fallback<T>>,
    ) -> Result<T, DaemonError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DaemonError>>,
    {
        self.run(operation, policy, None, primary, fallback, &NoopListener)
            .await
    }

    /// The full retry loop.
    ///
    /// - The breaker is consulted before every attempt. A rejection ends the
    ///   loop at once, so an open breaker never waits on a timeout.
    /// - Each attempt is bounded by `policy.attempt_timeout` and by whatever
    ///   is left of `deadline`. A timeout counts as a failure.
    /// - Non-retryable errors and cancellation are returned as-is: no retry,
    ///   no fallback, and no effect on the breaker.
    /// - No retry is started if its backoff would run past `deadline`.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        deadline: Option<Instant>,
        mut primary: F,
        fallback: Option<Fallback<T>>,
        listener: &dyn RetryListener,
    ) -> Result<T, DaemonError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DaemonError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let last_error = loop {
            let now = Instant::now();
            let remaining = match deadline {
                Some(d) if now >= d => {
                    break DaemonError::Timeout {
                        operation: operation.to_string(),
                        after: now.saturating_duration_since(started),
                    };
                }
                Some(d) => d - now,
                None => policy.attempt_timeout,
            };

            let permit = match self.breakers.try_acquire(operation) {
                Ok(permit) => permit,
                Err(rejection) => break rejection,
            };

            listener.on_attempt(attempt);
            let budget = policy.attempt_timeout.min(remaining);
            let error = match tokio::time::timeout(budget, primary(attempt)).await {
                Ok(Ok(value)) => {
                    permit.success();
                    return Ok(value);
                }
                // Cancellation ends the loop without touching the breaker.
                Ok(Err(DaemonError::Cancelled)) => {
                    permit.release();
                    return Err(DaemonError::Cancelled);
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    permit.release();
                    return Err(e);
                }
                Ok(Err(e)) => {
                    permit.failure();
                    e
                }
                Err(_) => {
                    permit.failure();
                    DaemonError::Timeout {
                        operation: operation.to_string(),
                        after: budget,
                    }
                }
            };

            if attempt >= policy.max_retries {
                break error;
            }
            let delay = policy.backoff(attempt);
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                debug!(operation, "Skipping retry: backoff would pass the deadline.");
                break error;
            }

            attempt += 1;
            listener.on_retry(attempt, delay, &error);
            if let Some(metrics) = &self.metrics {
                metrics.record(MetricSample::count(MetricType::RequestRetried));
            }
            debug!(operation, attempt, ?delay, error = %error, "Retrying after failure.");
            tokio::time::sleep(delay).await;
        };

        match fallback {
            Some(fallback) => {
                debug!(operation, error = %last_error, "Primary unavailable; using fallback.");
                fallback(last_error).await
            }
            None => Err(last_error),
        }
    }
}
