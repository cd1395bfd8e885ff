// src/core/telemetry/log_sampler.rs

//! Deterministic per-key log sampling.

use super::log_delivery::LogLevel;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// Emits every n-th event per sample key. Warning and above always pass.
///
/// Counters live in a bounded LRU, so a flood of distinct keys evicts the
/// least recently used counters instead of growing without bound. An evicted
/// key starts over at zero, which means its next event is emitted.
#[derive(Debug)]
pub struct LogSampler {
    default_interval: u64,
    overrides: HashMap<String, u64>,
    counter_reset: u64,
    counters: Mutex<LruCache<String, u64>>,
}

impl LogSampler {
    pub fn new(
        default_interval: u64,
        overrides: HashMap<String, u64>,
        max_keys: usize,
        counter_reset: u64,
    ) -> Self {
        Self {
            default_interval: default_interval.max(1),
            overrides,
            counter_reset: counter_reset.max(1),
            counters: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// The interval that applies to `key`.
    pub fn interval_for(&self, key: &str) -> u64 {
        self.overrides
            .get(key)
            .copied()
            .unwrap_or(self.default_interval)
            .max(1)
    }

    /// Returns the interval the event was sampled at if it should be emitted,
    /// or `None` if it is sampled out.
    pub fn sample(&self, level: LogLevel, key: &str) -> Option<u64> {
        if level.is_exempt_from_sampling() {
            return Some(1);
        }
        let interval = self.interval_for(key);
        if interval == 1 {
            return Some(1);
        }

        let mut counters = self.counters.lock();
        let count = match counters.get_mut(key) {
            Some(counter) => {
                let current = *counter;
                *counter = if current + 1 >= self.counter_reset {
                    0
                } else {
                    current + 1
                };
                current
            }
            None => {
                counters.put(key.to_string(), 1);
                0
            }
        };
        (count % interval == 0).then_some(interval)
    }

    pub fn tracked_keys(&self) -> usize {
        self.counters.lock().len()
    }
}
