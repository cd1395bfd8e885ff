// src/core/telemetry/sampler.rs

//! The adaptive sampler that decides which non-critical samples are kept.

use crate::config::SamplerConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Multiplier applied to the rate when the buffer is under pressure.
const DECREASE_FACTOR: f64 = 0.7;
/// Multiplier applied to the rate when the buffer has room to spare.
const INCREASE_FACTOR: f64 = 1.25;

/// A lock-free, deterministic sampler.
///
/// Decisions come from a fractional accumulator over a global counter: the
/// n-th candidate is kept when `floor((n + 1) * r) > floor(n * r)`. At a fixed
/// rate this keeps exactly `floor(M * r)` of `M` candidates, evenly spread,
/// with no RNG on the hot path.
#[derive(Debug)]
pub struct AdaptiveSampler {
    rate_bits: AtomicU64,
    counter: AtomicU64,
    min_rate: f64,
    max_rate: f64,
    high_watermark: f64,
    low_watermark: f64,
    adjust_interval: Duration,
    epoch: Instant,
    /// Milliseconds since `epoch` at which the rate was last evaluated.
    last_adjust_ms: AtomicU64,
}

impl AdaptiveSampler {
    pub fn new(config: &SamplerConfig) -> Self {
        let rate = config.base_rate.clamp(config.min_rate, config.max_rate);
        Self {
            rate_bits: AtomicU64::new(rate.to_bits()),
            counter: AtomicU64::new(0),
            min_rate: config.min_rate,
            max_rate: config.max_rate,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
            adjust_interval: config.adjust_interval,
            epoch: Instant::now(),
            last_adjust_ms: AtomicU64::new(0),
        }
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    /// Decides whether the next candidate is kept. Returns the rate the
    /// decision was made under, so the caller can weight the sample.
    pub fn should_sample(&self) -> Option<f64> {
        let rate = self.rate();
        if rate >= 1.0 {
            return Some(1.0);
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed) as f64;
        if ((n + 1.0) * rate).floor() > (n * rate).floor() {
            Some(rate)
        } else {
            None
        }
    }

    /// Re-evaluates the rate against the current buffer occupancy (`0.0..=1.0`).
    /// Runs at most once per adjust interval. Concurrent callers race on a CAS
    /// and only the winner adjusts. Returns the new rate if it changed.
    pub fn maybe_adjust(&self, occupancy: f64) -> Option<f64> {
        let now_ms = Instant::now()
            .saturating_duration_since(self.epoch)
            .as_millis() as u64;
        let last = self.last_adjust_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.adjust_interval.as_millis() as u64 {
            return None;
        }
        if self
            .last_adjust_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        let current = self.rate();
        let proposed = if occupancy > self.high_watermark {
            current * DECREASE_FACTOR
        } else if occupancy < self.low_watermark {
            current * INCREASE_FACTOR
        } else {
            return None;
        };
        let next = proposed.clamp(self.min_rate, self.max_rate);
        if (next - current).abs() < f64::EPSILON {
            return None;
        }
        self.rate_bits.store(next.to_bits(), Ordering::Relaxed);
        Some(next)
    }
}
