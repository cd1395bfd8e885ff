// src/core/telemetry/collector.rs

//! The metrics collector: sampled samples land in a fixed-capacity ring buffer,
//! and a periodic flush turns them into per-type estimates.

use super::sample::{MetricSample, MetricType};
use super::sampler::AdaptiveSampler;
use crate::config::MetricsConfig;
use crate::core::DaemonError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use strum::{EnumCount, IntoEnumIterator};
use tracing::warn;

/// Receives the aggregate of each flush interval.
pub trait MetricsPublisher: Send + Sync {
    fn publish(&self, metrics: &AggregatedMetrics) -> Result<(), DaemonError>;
}

/// Estimates for one metric type over one or more flush intervals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricAggregate {
    /// Samples actually stored.
    pub kept: u64,
    /// Kept samples scaled by the inverse of the rate they were kept under.
    pub estimated_count: f64,
    pub estimated_sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for MetricAggregate {
    fn default() -> Self {
        Self {
            kept: 0,
            estimated_count: 0.0,
            estimated_sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl MetricAggregate {
    fn add(&mut self, value: f64, weight: f64) {
        self.kept += 1;
        self.estimated_count += weight;
        self.estimated_sum += value * weight;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &MetricAggregate) {
        self.kept += other.kept;
        self.estimated_count += other.estimated_count;
        self.estimated_sum += other.estimated_sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> Option<f64> {
        (self.estimated_count > 0.0).then(|| self.estimated_sum / self.estimated_count)
    }

    fn is_empty(&self) -> bool {
        self.kept == 0
    }
}

/// The result of a flush.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedMetrics {
    pub aggregates: BTreeMap<MetricType, MetricAggregate>,
    /// The sample rate in effect when the flush ran.
    pub sample_rate: f64,
    /// Number of flush intervals folded into this aggregate. More than one
    /// means earlier publishes failed and were carried forward.
    pub intervals: u32,
}

impl AggregatedMetrics {
    pub fn get(&self, metric_type: MetricType) -> Option<&MetricAggregate> {
        self.aggregates.get(&metric_type)
    }

    pub fn estimated_count(&self, metric_type: MetricType) -> f64 {
        self.get(metric_type).map_or(0.0, |a| a.estimated_count)
    }

    pub fn merge(&mut self, other: AggregatedMetrics) {
        for (metric_type, aggregate) in other.aggregates {
            self.aggregates
                .entry(metric_type)
                .or_default()
                .merge(&aggregate);
        }
        self.intervals += other.intervals;
    }
}

#[derive(Debug, Clone, Copy)]
struct RingEntry {
    metric_type: MetricType,
    value: f64,
    weight: f64,
}

#[derive(Debug)]
struct Ring {
    entries: VecDeque<RingEntry>,
    capacity: usize,
    /// Overwritten entries, folded per type so no weight is lost between flushes.
    evicted: [MetricAggregate; MetricType::COUNT],
}

impl Ring {
    fn push(&mut self, entry: RingEntry) -> bool {
        let overwritten = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        if let Some(old) = overwritten {
            self.evicted[old.metric_type.index()].add(old.value, old.weight);
        }
        self.entries.push_back(entry);
        overwritten.is_some()
    }
}

/// Counters describing the collector itself.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CollectorStats {
    pub recorded: u64,
    pub kept: u64,
    pub critical: u64,
    pub overwritten: u64,
    pub resident: usize,
    pub capacity: usize,
    pub sample_rate: f64,
    pub publish_failures: u64,
}

#[derive(Debug)]
pub struct MetricsCollector {
    sampler: AdaptiveSampler,
    ring: Mutex<Ring>,
    capacity: usize,
    /// Aggregate of intervals whose publish failed.
    carried: Mutex<Option<AggregatedMetrics>>,
    /// The last successfully published aggregate.
    latest: Mutex<Option<AggregatedMetrics>>,
    recorded: AtomicU64,
    kept: AtomicU64,
    critical: AtomicU64,
    overwritten: AtomicU64,
    publish_failures: AtomicU64,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Self {
        let capacity = config.ring_capacity.max(1);
        Self {
            sampler: AdaptiveSampler::new(&config.sampler),
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                evicted: [MetricAggregate::default(); MetricType::COUNT],
            }),
            capacity,
            carried: Mutex::new(None),
            latest: Mutex::new(None),
            recorded: AtomicU64::new(0),
            kept: AtomicU64::new(0),
            critical: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }
    }

    /// Records one sample. Never blocks on I/O and never fails.
    ///
    /// The sampling decision is made before any lock is taken, so rejected
    /// samples cost two atomic operations.
    pub fn record(&self, sample: MetricSample) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        let weight = if sample.is_critical {
            self.critical.fetch_add(1, Ordering::Relaxed);
            1.0
        } else {
            match self.sampler.should_sample() {
                Some(rate) => 1.0 / rate,
                None => return,
            }
        };

        let (overwrote, resident) = {
            let mut ring = self.ring.lock();
            let overwrote = ring.push(RingEntry {
                metric_type: sample.metric_type,
                value: sample.value,
                weight,
            });
            (overwrote, ring.entries.len())
        };
        self.kept.fetch_add(1, Ordering::Relaxed);
        if overwrote {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.sampler
            .maybe_adjust(resident as f64 / self.capacity as f64);
    }

    /// Drains the ring and returns the estimates for the interval, merged
    /// with anything carried over from failed publishes.
    pub fn flush(&self) -> AggregatedMetrics {
        let (entries, evicted) = {
            let mut ring = self.ring.lock();
            let occupancy = ring.entries.len() as f64 / self.capacity as f64;
            self.sampler.maybe_adjust(occupancy);
            let entries = std::mem::take(&mut ring.entries);
            let evicted = std::mem::replace(
                &mut ring.evicted,
                [MetricAggregate::default(); MetricType::COUNT],
            );
            ring.entries.reserve(self.capacity);
            (entries, evicted)
        };

        let mut aggregates: BTreeMap<MetricType, MetricAggregate> = BTreeMap::new();
        for entry in entries {
            aggregates
                .entry(entry.metric_type)
                .or_default()
                .add(entry.value, entry.weight);
        }
        for metric_type in MetricType::iter() {
            let carry = &evicted[metric_type.index()];
            if !carry.is_empty() {
                aggregates.entry(metric_type).or_default().merge(carry);
            }
        }

        let mut result = AggregatedMetrics {
            aggregates,
            sample_rate: self.sampler.rate(),
            intervals: 1,
        };
        if let Some(carried) = self.carried.lock().take() {
            result.merge(carried);
        }
        result
    }

    /// Flushes and hands the aggregate to `publisher`. On failure the
    /// aggregate is kept and folded into the next flush.
    pub fn flush_to(&self, publisher: &dyn MetricsPublisher) -> AggregatedMetrics {
        let aggregate = self.flush();
        match publisher.publish(&aggregate) {
            Ok(()) => {
                *self.latest.lock() = Some(aggregate.clone());
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Failed to publish metrics ({} intervals pending): {}",
                    aggregate.intervals, e
                );
                *self.carried.lock() = Some(aggregate.clone());
            }
        }
        aggregate
    }

    /// The most recently published aggregate, if any.
    pub fn latest(&self) -> Option<AggregatedMetrics> {
        self.latest.lock().clone()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sampler.rate()
    }

    /// Entries currently stored in the ring. Never exceeds the capacity.
    pub fn resident(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            kept: self.kept.load(Ordering::Relaxed),
            critical: self.critical.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            resident: self.resident(),
            capacity: self.capacity,
            sample_rate: self.sample_rate(),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}
