// tests/unit_retry_test.rs

use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tidegate::config::{CircuitBreakerConfig, RetryConfig};
use tidegate::core::DaemonError;
use tidegate::core::resilience::{
    CircuitBreakerRegistry, CircuitState, Fallback, RetryExecutor, RetryListener, RetryPolicy,
};
use tokio::time::Instant;

fn executor(threshold: u32) -> (RetryExecutor, Arc<CircuitBreakerRegistry>) {
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        &CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(300),
        },
        None,
    ));
    (RetryExecutor::new(Arc::clone(&breakers), None), breakers)
}

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        attempt_timeout: Duration::from_secs(5),
        base_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(4),
        jitter: 0.0,
    }
}

#[derive(Default)]
struct RecordingListener {
    attempts: Mutex<Vec<u32>>,
    delays: Mutex<Vec<Duration>>,
}

impl RetryListener for RecordingListener {
    fn on_attempt(&self, attempt: u32) {
        self.attempts.lock().push(attempt);
    }
    fn on_retry(&self, _retry: u32, delay: Duration, _error: &DaemonError) {
        self.delays.lock().push(delay);
    }
}

#[test]
fn test_backoff_doubles_and_caps() {
    let p = policy(3);
    assert_eq!(p.backoff(0), Duration::from_secs(1));
    assert_eq!(p.backoff(1), Duration::from_secs(2));
    assert_eq!(p.backoff(2), Duration::from_secs(4));
    assert_eq!(p.backoff(3), Duration::from_secs(4));
    assert_eq!(p.backoff(40), Duration::from_secs(4));
}

#[test]
fn test_backoff_jitter_stays_within_cap() {
    let mut p = policy(3);
    p.jitter = 0.5;
    for retry in 0..5 {
        let delay = p.backoff(retry);
        assert!(delay <= p.max_backoff);
    }
}

#[test]
fn test_policy_from_config() {
    let config = RetryConfig {
        max_retries: 2,
        base_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(800),
        jitter: 0.0,
    };
    let p = RetryPolicy::from_config(&config, Duration::from_secs(3));
    assert_eq!(p.max_retries, 2);
    assert_eq!(p.attempt_timeout, Duration::from_secs(3));
    assert_eq!(p.backoff(5), Duration::from_millis(800));
}

#[tokio::test(start_paused = true)]
async fn test_succeeds_after_transient_failures() {
    let (executor, breakers) = executor(5);
    let listener = RecordingListener::default();
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let result = executor
        .run(
            "upstream",
            &policy(3),
            None,
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DaemonError::transient("upstream", "flaky"))
                    } else {
                        Ok(n)
                    }
                }
            },
            None,
            &listener,
        )
        .await;

    assert_eq!(result, Ok(2));
    assert_eq!(*listener.attempts.lock(), vec![0, 1, 2]);
    assert_eq!(
        *listener.delays.lock(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(breakers.consecutive_failures("upstream"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_return_last_error() {
    let (executor, _) = executor(10);
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = executor
        .execute("upstream", &policy(2), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(DaemonError::transient("upstream", format!("attempt {attempt}"))) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        result,
        Err(DaemonError::transient("upstream", "attempt 2"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_skips_retry_and_fallback() {
    let (executor, breakers) = executor(1);
    let calls = AtomicU32::new(0);
    let fallback: Fallback<u32> = Box::new(|_| async { Ok(99) }.boxed());

    let result = executor
        .execute_with_fallback(
            "upstream",
            &policy(3),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DaemonError::InvalidRequest("bad params".into())) }
            },
            Some(fallback),
        )
        .await;

    assert_eq!(result, Err(DaemonError::InvalidRequest("bad params".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(breakers.state("upstream"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_counts_as_failure() {
    let (executor, breakers) = executor(1);
    let started = Instant::now();

    let result: Result<(), _> = executor
        .execute(
            "slow",
            &RetryPolicy::single_attempt(Duration::from_millis(500)),
            |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await;

    assert!(matches!(result, Err(DaemonError::Timeout { .. })));
    assert_eq!(started.elapsed(), Duration::from_millis(500));
    assert_eq!(breakers.state("slow"), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_fails_fast_without_calling_primary() {
    let (executor, breakers) = executor(5);
    let single = RetryPolicy::single_attempt(Duration::from_secs(5));

    for _ in 0..5 {
        let result: Result<(), _> = executor
            .execute("upstreamA", &single, |_| async {
                Err(DaemonError::transient("upstreamA", "down"))
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breakers.state("upstreamA"), CircuitState::Open);

    let calls = AtomicU32::new(0);
    let started = Instant::now();
    let result: Result<(), _> = executor
        .execute("upstreamA", &single, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

    assert!(matches!(result, Err(DaemonError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_answers_when_breaker_is_open() {
    let (executor, breakers) = executor(1);
    breakers.try_acquire("upstream").unwrap().failure();

    let fallback: Fallback<String> = Box::new(|error| {
        async move {
            assert!(matches!(error, DaemonError::CircuitOpen { .. }));
            Ok("cached".to_string())
        }
        .boxed()
    });
    let result = executor
        .execute_with_fallback(
            "upstream",
            &policy(3),
            |_| async { Ok("live".to_string()) },
            Some(fallback),
        )
        .await;

    assert_eq!(result, Ok("cached".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_retry_is_skipped_when_backoff_passes_deadline() {
    let (executor, _) = executor(10);
    let calls = AtomicU32::new(0);
    let deadline = Instant::now() + Duration::from_millis(1500);

    let result: Result<(), _> = executor
        .run(
            "upstream",
            &policy(5),
            Some(deadline),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DaemonError::transient("upstream", "down")) }
            },
            None,
            &tidegate::core::resilience::NoopListener,
        )
        .await;

    // Attempt 0, wait 1s, attempt 1; the next 2s backoff would pass the deadline.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(result.is_err());
    assert!(Instant::now() < deadline);
}
