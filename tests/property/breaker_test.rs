// tests/property/breaker_test.rs

//! The circuit breaker against a simple model: it opens exactly when the
//! failure streak reaches the threshold, and an open breaker admits nothing
//! until its recovery timeout passes.

use proptest::prelude::*;
use std::time::Duration;
use tidegate::config::CircuitBreakerConfig;
use tidegate::core::resilience::{CircuitBreakerRegistry, CircuitState};

fn registry(threshold: u32) -> CircuitBreakerRegistry {
    CircuitBreakerRegistry::new(
        &CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(3600),
        },
        None,
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_breaker_follows_the_failure_streak(
        threshold in 1u32..8,
        outcomes in prop::collection::vec(any::<bool>(), 0..64),
    ) {
        let breakers = registry(threshold);
        let mut streak = 0u32;
        let mut open = false;

        for ok in outcomes {
            let acquired = breakers.try_acquire("upstream");
            if open {
                prop_assert!(acquired.is_err());
                continue;
            }
            let permit = acquired.expect("closed breaker admits calls");
            if ok {
                permit.success();
                streak = 0;
            } else {
                streak += 1;
                let opened = permit.failure();
                prop_assert_eq!(opened, streak == threshold);
                open = opened;
            }
            prop_assert_eq!(breakers.consecutive_failures("upstream"), streak);
        }

        let expected = if open { CircuitState::Open } else { CircuitState::Closed };
        prop_assert_eq!(breakers.state("upstream"), expected);
        prop_assert_eq!(breakers.open_count(), usize::from(open));
    }

    #[test]
    fn test_operations_never_share_state(
        failures_a in 0u32..10,
        failures_b in 0u32..10,
    ) {
        let breakers = registry(5);
        for _ in 0..failures_a {
            if let Ok(permit) = breakers.try_acquire("a") {
                permit.failure();
            }
        }
        for _ in 0..failures_b {
            if let Ok(permit) = breakers.try_acquire("b") {
                permit.failure();
            }
        }
        prop_assert_eq!(breakers.consecutive_failures("a"), failures_a.min(5));
        prop_assert_eq!(breakers.consecutive_failures("b"), failures_b.min(5));
        prop_assert_eq!(breakers.try_acquire("a").is_err(), failures_a >= 5);
        prop_assert_eq!(breakers.try_acquire("b").is_err(), failures_b >= 5);
    }
}
