// tests/property/sampler_test.rs

//! Sampling must be exact over any run length: the metrics sampler keeps
//! `floor(n * rate)` of `n` candidates and the log sampler emits every
//! interval-th event of a key.

use proptest::prelude::*;
use std::collections::HashMap;
use tidegate::config::SamplerConfig;
use tidegate::core::telemetry::{AdaptiveSampler, LogLevel, LogSampler};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_metrics_sampler_keeps_an_exact_share(
        rate in 0.001f64..0.999,
        candidates in 0usize..5_000,
    ) {
        let sampler = AdaptiveSampler::new(&SamplerConfig {
            base_rate: rate,
            min_rate: rate,
            max_rate: rate,
            ..SamplerConfig::default()
        });
        let mut kept = 0usize;
        for _ in 0..candidates {
            if let Some(weight_rate) = sampler.should_sample() {
                prop_assert_eq!(weight_rate, rate);
                kept += 1;
            }
        }
        prop_assert_eq!(kept, (candidates as f64 * rate).floor() as usize);
    }

    #[test]
    fn test_log_sampler_emits_every_interval_th_event(
        interval in 1u64..50,
        events in 0u64..500,
        warnings in 0usize..20,
    ) {
        let sampler = LogSampler::new(interval, HashMap::new(), 8, u64::MAX);
        let emitted = (0..events)
            .filter(|_| sampler.sample(LogLevel::Info, "key").is_some())
            .count() as u64;
        prop_assert_eq!(emitted, events.div_ceil(interval));

        // Warnings and above are never sampled out.
        for _ in 0..warnings {
            prop_assert_eq!(sampler.sample(LogLevel::Warn, "key"), Some(1));
        }
    }
}
