// src/connection/manager.rs

//! The `ConnectionManager` owns every transport connection: its socket write
//! half, its bounded outbound queue, and its liveness.
//!
//! Sending never blocks. `send` only pushes onto the connection's queue; a
//! dedicated writer task per connection pops frames and writes them one at a
//! time under the connection's send lock, so there is never more than one
//! write in flight on a socket. A connection therefore holds at most its queue
//! capacity in waiting frames plus the one being written.

use super::outbound::OutboundQueue;
use super::sink::FrameSink;
use crate::config::{ConnectionConfig, UnregisterPolicy};
use crate::core::DaemonError;
use crate::core::dedup::Deduplicator;
use crate::core::session::LivenessProbe;
use crate::core::telemetry::{MetricSample, MetricType, MetricsCollector};
use crate::core::types::{ConnectionId, Origin};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// What a transport hands over when it registers a connection.
pub struct ConnectionRegistration {
    /// Identifies the underlying transport, e.g. the peer address. Two live
    /// connections may not share a key.
    pub transport_key: String,
    pub sink: Box<dyn FrameSink>,
}

/// The result of a successful `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// An identical frame was sent within the dedup window; nothing was queued.
    Duplicate,
    /// The frame was queued after evicting the oldest unsent frame.
    QueuedWithOverflow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnregisterReport {
    /// Queued frames written out before the socket closed.
    pub flushed: u64,
    /// Queued frames discarded.
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub flushed: u64,
    pub dropped: u64,
    pub closed: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConnectionStats {
    pub open: usize,
    pub registered_total: u64,
    pub closed_total: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub duplicates_suppressed: u64,
    pub write_failures: u64,
}

struct ConnectionEntry {
    id: ConnectionId,
    transport_key: String,
    queue: Mutex<OutboundQueue>,
    wakeup: Notify,
    /// The send lock. Holding it is the only way to touch the socket.
    writer: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    /// Lets a bounded unregister stop a writer stuck on a stalled peer.
    writer_task: Mutex<Option<AbortHandle>>,
    /// Milliseconds since the manager's epoch.
    last_activity_ms: AtomicU64,
    state: AtomicU8,
}

impl ConnectionEntry {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
    by_key: DashMap<String, ConnectionId>,
    next_id: AtomicU64,
    dedup: Deduplicator,
    queue_capacity: usize,
    default_policy: UnregisterPolicy,
    metrics: Option<Arc<MetricsCollector>>,
    epoch: Instant,
    registered_total: AtomicU64,
    closed_total: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    write_failures: AtomicU64,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("open", &self.connections.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(config: &ConnectionConfig, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            connections: DashMap::new(),
            by_key: DashMap::new(),
            next_id: AtomicU64::new(1),
            dedup: Deduplicator::new(config.dedup_window, config.dedup_capacity),
            queue_capacity: config.outbound_queue_capacity.max(1),
            default_policy: config.unregister_policy,
            metrics,
            epoch: Instant::now(),
            registered_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    fn record(&self, metric_type: MetricType, value: f64, id: ConnectionId) {
        if let Some(metrics) = &self.metrics {
            metrics.record(MetricSample::new(metric_type, value, Origin::Connection(id)));
        }
    }

    fn now_ms(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.epoch)
            .as_millis() as u64
    }

    fn entry(&self, id: ConnectionId) -> Result<Arc<ConnectionEntry>, DaemonError> {
        self.connections
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(DaemonError::ConnectionNotFound(id))
    }

    /// Registers a transport connection and starts its writer task.
    pub fn register(
        self: &Arc<Self>,
        registration: ConnectionRegistration,
    ) -> Result<ConnectionId, DaemonError> {
        let id = match self.by_key.entry(registration.transport_key.clone()) {
            Entry::Occupied(existing) => {
                return Err(DaemonError::DuplicateConnection(*existing.get()));
            }
            Entry::Vacant(slot) => {
                let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
                slot.insert(id);
                id
            }
        };

        let entry = Arc::new(ConnectionEntry {
            id,
            transport_key: registration.transport_key,
            queue: Mutex::new(OutboundQueue::new(self.queue_capacity)),
            wakeup: Notify::new(),
            writer: tokio::sync::Mutex::new(Some(registration.sink)),
            writer_task: Mutex::new(None),
            last_activity_ms: AtomicU64::new(self.now_ms()),
            state: AtomicU8::new(ConnectionState::Open as u8),
        });
        self.connections.insert(id, Arc::clone(&entry));
        self.registered_total.fetch_add(1, Ordering::Relaxed);
        self.record(MetricType::ConnectionOpened, 1.0, id);
        debug!(connection = %id, key = %entry.transport_key, "Connection registered.");

        let task = tokio::spawn(Self::write_loop(Arc::clone(self), Arc::clone(&entry)));
        *entry.writer_task.lock() = Some(task.abort_handle());
        Ok(id)
    }

    /// The per-connection writer. Exits once the connection leaves `Open`
    /// and its queue is empty, or on the first write failure.
    async fn write_loop(manager: Arc<Self>, entry: Arc<ConnectionEntry>) {
        loop {
            let next = entry.queue.lock().pop();
            let Some(frame) = next else {
                if entry.state() != ConnectionState::Open {
                    break;
                }
                entry.wakeup.notified().await;
                continue;
            };

            let result = {
                let mut writer = entry.writer.lock().await;
                match writer.as_mut() {
                    Some(sink) => sink.send_frame(frame).await,
                    // `unregister` took the socket and handles what is left
                    // in the queue. The frame in hand is lost.
                    None => {
                        manager.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            };

            match result {
                Ok(()) => {
                    entry
                        .last_activity_ms
                        .store(manager.now_ms(), Ordering::Relaxed);
                    manager.frames_sent.fetch_add(1, Ordering::Relaxed);
                    manager.record(MetricType::FrameSent, 1.0, entry.id);
                }
                Err(e) => {
                    warn!(connection = %entry.id, "Write failed, closing connection: {}", e);
                    manager.write_failures.fetch_add(1, Ordering::Relaxed);
                    manager.record(MetricType::WriteFailure, 1.0, entry.id);
                    entry.set_state(ConnectionState::Closing);
                    manager.unregister(entry.id, UnregisterPolicy::Discard).await;
                    break;
                }
            }
        }
    }

    /// Queues `frame` for delivery. Never blocks and never waits for the socket.
    pub fn send(&self, id: ConnectionId, frame: String) -> Result<SendOutcome, DaemonError> {
        let entry = self.entry(id)?;
        if entry.state() != ConnectionState::Open {
            return Err(DaemonError::ConnectionClosed(id));
        }
        if self
            .dedup
            .check_and_record(&outbound_scope(id), frame.as_bytes())
        {
            self.record(MetricType::DuplicateSuppressed, 1.0, id);
            return Ok(SendOutcome::Duplicate);
        }

        let evicted = entry.queue.lock().push(frame);
        entry.wakeup.notify_one();
        if evicted.is_some() {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            self.record(MetricType::QueueOverflow, 1.0, id);
            debug!(connection = %id, "Outbound queue full; dropped the oldest frame.");
            return Ok(SendOutcome::QueuedWithOverflow);
        }
        Ok(SendOutcome::Queued)
    }

    /// Marks a successful read on the connection.
    pub fn mark_active(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.get(&id) {
            entry.last_activity_ms.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// Records an inbound payload. Returns true if it duplicates one seen on
    /// this connection within the dedup window.
    pub fn record_inbound(&self, id: ConnectionId, payload: &[u8]) -> Result<bool, DaemonError> {
        let entry = self.entry(id)?;
        entry.last_activity_ms.store(self.now_ms(), Ordering::Relaxed);
        let duplicate = self.dedup.check_and_record(&inbound_scope(id), payload);
        if duplicate {
            self.record(MetricType::DuplicateSuppressed, 1.0, id);
        }
        Ok(duplicate)
    }

    /// Unregisters with the configured default policy.
    pub async fn unregister_default(&self, id: ConnectionId) -> Option<UnregisterReport> {
        self.unregister(id, self.default_policy).await
    }

    /// Closes and forgets a connection. Only the first call for an id does
    /// anything; later calls return `None`.
    pub async fn unregister(
        &self,
        id: ConnectionId,
        policy: UnregisterPolicy,
    ) -> Option<UnregisterReport> {
        self.unregister_within(id, policy, None).await
    }

    async fn unregister_within(
        &self,
        id: ConnectionId,
        policy: UnregisterPolicy,
        deadline: Option<Instant>,
    ) -> Option<UnregisterReport> {
        let (_, entry) = self.connections.remove(&id)?;
        self.by_key
            .remove_if(&entry.transport_key, |_, owner| *owner == id);
        entry.set_state(ConnectionState::Closing);

        // Waits for any write in progress, then keeps the writer task out.
        let locked = match deadline {
            Some(at) => tokio::time::timeout_at(at, entry.writer.lock()).await.ok(),
            None => Some(entry.writer.lock().await),
        };
        let Some(mut writer) = locked else {
            return Some(self.abort_writer(&entry));
        };
        let pending = entry.queue.lock().take_all();
        let mut report = UnregisterReport::default();

        match writer.take() {
            Some(mut sink) => {
                let mut remaining = pending.into_iter();
                if policy == UnregisterPolicy::Drain {
                    for frame in remaining.by_ref() {
                        let write = sink.send_frame(frame);
                        let result = match deadline {
                            Some(at) => tokio::time::timeout_at(at, write)
                                .await
                                .unwrap_or_else(|e| Err(e.into())),
                            None => write.await,
                        };
                        if result.is_err() {
                            report.dropped += 1;
                            break;
                        }
                        report.flushed += 1;
                    }
                }
                report.dropped += remaining.count() as u64;
                let close = sink.close();
                let _ = match deadline {
                    Some(at) => tokio::time::timeout_at(at, close)
                        .await
                        .unwrap_or_else(|e| Err(e.into())),
                    None => close.await,
                };
            }
            None => report.dropped = pending.len() as u64,
        }
        drop(writer);

        self.finish_unregister(&entry, report);
        Some(report)
    }

    /// Force-closes a connection whose writer still holds the send lock when
    /// the deadline passes. The frame being written and everything queued
    /// behind it count as dropped. The sink is released with the aborted task.
    fn abort_writer(&self, entry: &ConnectionEntry) -> UnregisterReport {
        if let Some(task) = entry.writer_task.lock().take() {
            task.abort();
        }
        let pending = entry.queue.lock().take_all();
        let report = UnregisterReport {
            flushed: 0,
            dropped: pending.len() as u64 + 1,
        };
        warn!(
            connection = %entry.id,
            dropped = report.dropped,
            "Writer stalled past the deadline; connection force-closed."
        );
        self.finish_unregister(entry, report);
        report
    }

    fn finish_unregister(&self, entry: &ConnectionEntry, report: UnregisterReport) {
        entry.set_state(ConnectionState::Closed);
        entry.wakeup.notify_one();
        self.frames_sent.fetch_add(report.flushed, Ordering::Relaxed);
        self.frames_dropped
            .fetch_add(report.dropped, Ordering::Relaxed);
        self.closed_total.fetch_add(1, Ordering::Relaxed);
        self.record(MetricType::ConnectionClosed, 1.0, entry.id);
        debug!(
            connection = %entry.id,
            flushed = report.flushed,
            dropped = report.dropped,
            "Connection unregistered."
        );
    }

    /// Drains and closes every connection. Frames still unwritten when the
    /// grace period ends are dropped.
    pub async fn shutdown_all(&self, grace: Duration) -> ShutdownReport {
        let deadline = Instant::now() + grace;
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        let reports = futures::future::join_all(
            ids.into_iter()
                .map(|id| self.unregister_within(id, UnregisterPolicy::Drain, Some(deadline))),
        )
        .await;

        let mut summary = ShutdownReport::default();
        for report in reports.into_iter().flatten() {
            summary.flushed += report.flushed;
            summary.dropped += report.dropped;
            summary.closed += 1;
        }
        info!(
            flushed = summary.flushed,
            dropped = summary.dropped,
            closed = summary.closed,
            "All connections closed."
        );
        summary
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(|entry| entry.state())
    }

    pub fn queue_len(&self, id: ConnectionId) -> Option<usize> {
        self.connections.get(&id).map(|entry| entry.queue.lock().len())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            open: self.len(),
            registered_total: self.registered_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            duplicates_suppressed: self.dedup.suppressed(),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

impl LivenessProbe for ConnectionManager {
    fn last_activity(&self, connection_id: ConnectionId) -> Option<Instant> {
        let entry = self.connections.get(&connection_id)?;
        if entry.state() != ConnectionState::Open {
            return None;
        }
        let ms = entry.last_activity_ms.load(Ordering::Relaxed);
        Some(self.epoch + Duration::from_millis(ms))
    }
}

fn outbound_scope(id: ConnectionId) -> String {
    format!("out:{}", id.0)
}

fn inbound_scope(id: ConnectionId) -> String {
    format!("in:{}", id.0)
}
