// src/core/telemetry/log_delivery.rs

//! Asynchronous, bounded log delivery.
//!
//! Producers call `enqueue`, which only touches an in-memory queue. A background
//! drain worker takes batches off the queue, applies per-key sampling, and
//! writes the survivors to the sink. A slow or broken sink can therefore never
//! stall the request path; at worst, events are dropped and counted.

use super::collector::MetricsCollector;
use super::log_sampler::LogSampler;
use super::sample::{MetricSample, MetricType};
use super::sink::LogSink;
use crate::config::{LogConfig, OverflowStrategy};
use crate::core::types::Origin;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub fn is_exempt_from_sampling(self) -> bool {
        self >= LogLevel::Warn
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRIT",
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub target: String,
    /// Events sharing a key share one sampling counter.
    pub sample_key: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    /// An event keyed by its target.
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            level,
            message: message.into(),
            sample_key: target.clone(),
            target,
            timestamp: Utc::now(),
        }
    }

    pub fn with_sample_key(mut self, key: impl Into<String>) -> Self {
        self.sample_key = key.into();
        self
    }

    fn format_line(&self, interval: u64) -> String {
        format!(
            "{} {:>5} {}: {} [sample={} rate=1/{}]",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level.as_str(),
            self.target,
            self.message,
            self.sample_key,
            interval
        )
    }
}

/// What happened to an enqueued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The event was queued after evicting the oldest queued event.
    QueuedDroppedOldest,
    /// The incoming event was discarded.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub written: u64,
    pub sampled_out: u64,
    pub failed: u64,
}

impl DrainReport {
    /// True if the drain found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.written == 0 && self.sampled_out == 0 && self.failed == 0
    }

    fn absorb(&mut self, other: DrainReport) {
        self.written += other.written;
        self.sampled_out += other.sampled_out;
        self.failed += other.failed;
    }
}

/// Counters describing the delivery pipeline.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeliveryStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub sampled_out: u64,
    pub written: u64,
    pub sink_failures: u64,
    pub queue_depth: usize,
    pub capacity: usize,
}

pub struct AsyncLogDelivery {
    queue: Mutex<VecDeque<LogEvent>>,
    not_full: Condvar,
    ready: Notify,
    capacity: usize,
    overflow: OverflowStrategy,
    block_timeout: Duration,
    drain_batch: usize,
    sampler: LogSampler,
    sink: Mutex<Box<dyn LogSink>>,
    metrics: Option<Arc<MetricsCollector>>,
    paused: AtomicBool,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    sampled_out: AtomicU64,
    written: AtomicU64,
    sink_failures: AtomicU64,
}

impl std::fmt::Debug for AsyncLogDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLogDelivery")
            .field("capacity", &self.capacity)
            .field("overflow", &self.overflow)
            .field("queue_depth", &self.queue_depth())
            .finish_non_exhaustive()
    }
}

impl AsyncLogDelivery {
    pub fn new(
        config: &LogConfig,
        sink: Box<dyn LogSink>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            not_full: Condvar::new(),
            ready: Notify::new(),
            capacity,
            overflow: config.overflow,
            block_timeout: config.block_timeout,
            drain_batch: config.drain_batch.max(1),
            sampler: LogSampler::new(
                config.sample_interval,
                config.sample_intervals.clone(),
                config.sampler_max_keys,
                config.counter_reset,
            ),
            sink: Mutex::new(sink),
            metrics,
            paused: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sampled_out: AtomicU64::new(0),
            written: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
        }
    }

    /// Hands an event to the delivery pipeline. Never performs I/O.
    ///
    /// With `BlockWithTimeout` the caller may wait up to the configured bound
    /// for the drain worker to make room; if none appears, the incoming event
    /// is dropped.
    pub fn enqueue(&self, event: LogEvent) -> EnqueueOutcome {
        let outcome = {
            let mut queue = self.queue.lock();
            if queue.len() < self.capacity {
                queue.push_back(event);
                EnqueueOutcome::Queued
            } else {
                match self.overflow {
                    OverflowStrategy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(event);
                        EnqueueOutcome::QueuedDroppedOldest
                    }
                    OverflowStrategy::DropNewest => EnqueueOutcome::Dropped,
                    OverflowStrategy::BlockWithTimeout => {
                        let deadline = std::time::Instant::now() + self.block_timeout;
                        while queue.len() >= self.capacity {
                            let remaining =
                                deadline.saturating_duration_since(std::time::Instant::now());
                            if remaining.is_zero()
                                || self.not_full.wait_for(&mut queue, remaining).timed_out()
                            {
                                break;
                            }
                        }
                        if queue.len() < self.capacity {
                            queue.push_back(event);
                            EnqueueOutcome::Queued
                        } else {
                            EnqueueOutcome::Dropped
                        }
                    }
                }
            }
        };

        match outcome {
            EnqueueOutcome::Queued => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                self.ready.notify_one();
            }
            EnqueueOutcome::QueuedDroppedOldest => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                self.record_drop();
                self.ready.notify_one();
            }
            EnqueueOutcome::Dropped => self.record_drop(),
        }
        outcome
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record(MetricSample::count(MetricType::LogDropped));
        }
    }

    /// Writes at most one batch to the sink. Does nothing while paused.
    pub fn drain_once(&self) -> DrainReport {
        if self.paused.load(Ordering::Acquire) {
            return DrainReport::default();
        }
        self.drain_batch()
    }

    /// Drains batch after batch until the queue is empty, the pipeline is
    /// paused, or `budget` is spent. At least one batch is attempted.
    pub fn drain_pending(&self, budget: Duration) -> DrainReport {
        let started = std::time::Instant::now();
        let mut total = DrainReport::default();
        loop {
            let report = self.drain_once();
            if report.is_empty() {
                break;
            }
            total.absorb(report);
            if started.elapsed() >= budget {
                break;
            }
        }
        total
    }

    fn drain_batch(&self) -> DrainReport {
        let batch: Vec<LogEvent> = {
            let mut queue = self.queue.lock();
            let n = queue.len().min(self.drain_batch);
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            return DrainReport::default();
        }
        self.not_full.notify_all();

        let mut report = DrainReport::default();
        let mut sink = self.sink.lock();
        for event in batch {
            let Some(interval) = self.sampler.sample(event.level, &event.sample_key) else {
                report.sampled_out += 1;
                continue;
            };
            match sink.write_line(&event.format_line(interval)) {
                Ok(()) => report.written += 1,
                Err(e) => {
                    if report.failed == 0 {
                        eprintln!("tidegate: log sink write failed: {e}");
                    }
                    report.failed += 1;
                }
            }
        }
        if let Err(e) = sink.flush() {
            if report.failed == 0 {
                eprintln!("tidegate: log sink flush failed: {e}");
            }
            report.failed += 1;
        }
        drop(sink);

        self.written.fetch_add(report.written, Ordering::Relaxed);
        self.sampled_out
            .fetch_add(report.sampled_out, Ordering::Relaxed);
        if report.failed > 0 {
            self.sink_failures.fetch_add(report.failed, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record(MetricSample::new(
                    MetricType::LogSinkFailure,
                    report.failed as f64,
                    Origin::Daemon,
                ));
            }
        }
        report
    }

    /// Drains until the queue is empty or `budget` runs out, ignoring any pause.
    /// Whatever is still queued afterwards is discarded and counted as dropped.
    /// Returns `(written, dropped)`.
    pub fn drain_all(&self, budget: Duration) -> (u64, u64) {
        let started = std::time::Instant::now();
        let mut written = 0;
        loop {
            let report = self.drain_batch();
            written += report.written;
            if self.queue_depth() == 0 || started.elapsed() >= budget {
                break;
            }
        }
        let leftover = {
            let mut queue = self.queue.lock();
            let n = queue.len() as u64;
            queue.clear();
            n
        };
        self.not_full.notify_all();
        self.dropped.fetch_add(leftover, Ordering::Relaxed);
        (written, leftover)
    }

    /// Completes when an event has been enqueued since the last wakeup.
    pub async fn notified(&self) {
        self.ready.notified().await
    }

    /// Stops `drain_once` from taking events off the queue.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.ready.notify_one();
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped(),
            sampled_out: self.sampled_out.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            capacity: self.capacity,
        }
    }

    /// A snapshot of queued events, oldest first.
    pub fn queued_events(&self) -> Vec<LogEvent> {
        self.queue.lock().iter().cloned().collect()
    }
}
