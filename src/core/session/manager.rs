// src/core/session/manager.rs

//! The session table: creation under admission limits, lookup with lazy
//! expiry, periodic sweeping, and rebinding across reconnects.
//!
//! Lock order: a shard lock may be held while touching `bindings`, never the
//! reverse. Observers and metrics are always invoked with no lock held.

use super::types::{
    ClientIdentity, CloseReason, LivenessProbe, Session, SessionObserver, SessionSnapshot,
    SessionState, SessionStats, SweepReport,
};
use crate::config::SessionConfig;
use crate::core::DaemonError;
use crate::core::errors::LimitScope;
use crate::core::telemetry::{MetricSample, MetricType, MetricsCollector};
use crate::core::types::{ConnectionId, Origin, SessionId};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One independently locked bucket of sessions.
#[derive(Debug, Default)]
struct SessionShard {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

pub struct SessionManager {
    shards: Vec<SessionShard>,
    /// Sessions currently bound to each connection.
    bindings: DashMap<ConnectionId, HashSet<SessionId>>,
    live: AtomicUsize,
    config: SessionConfig,
    liveness: Option<Arc<dyn LivenessProbe>>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
    metrics: Option<Arc<MetricsCollector>>,
    created_total: AtomicU64,
    resumed_total: AtomicU64,
    expired_total: AtomicU64,
    closed_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("shards", &self.shards.len())
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(
        config: &SessionConfig,
        liveness: Option<Arc<dyn LivenessProbe>>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| SessionShard::default())
            .collect();
        Self {
            shards,
            bindings: DashMap::new(),
            live: AtomicUsize::new(0),
            config: config.clone(),
            liveness,
            observers: RwLock::new(Vec::new()),
            metrics,
            created_total: AtomicU64::new(0),
            resumed_total: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().push(observer);
    }

    fn shard(&self, id: &SessionId) -> &SessionShard {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// True if `connection_id` names a connection the transport still holds open.
    fn is_connection_live(&self, connection_id: Option<ConnectionId>) -> bool {
        match (&self.liveness, connection_id) {
            (Some(probe), Some(id)) => probe.last_activity(id).is_some(),
            _ => false,
        }
    }

    fn record(&self, metric_type: MetricType, origin: Origin) {
        if let Some(metrics) = &self.metrics {
            metrics.record(MetricSample::new(metric_type, 1.0, origin));
        }
    }

    /// Clamps a requested TTL into the configured bounds.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.config.default_ttl)
            .clamp(self.config.min_ttl, self.config.max_ttl)
    }

    /// Reserves a per-connection and a global slot for `id`, or rejects.
    fn admit(&self, connection_id: ConnectionId, id: SessionId) -> Result<(), DaemonError> {
        let mut bound = self.bindings.entry(connection_id).or_default();
        if bound.len() >= self.config.max_sessions_per_connection {
            return Err(DaemonError::LimitExceeded {
                scope: LimitScope::PerConnection,
                limit: self.config.max_sessions_per_connection,
            });
        }
        let max = self.config.max_sessions;
        if self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Err(DaemonError::LimitExceeded {
                scope: LimitScope::Global,
                limit: max,
            });
        }
        bound.insert(id);
        Ok(())
    }

    fn unbind(&self, connection_id: ConnectionId, id: &SessionId) {
        if let Some(mut bound) = self.bindings.get_mut(&connection_id) {
            bound.remove(id);
        }
        self.bindings
            .remove_if(&connection_id, |_, bound| bound.is_empty());
    }

    /// Creates a session bound to `connection_id`. Limits are checked before
    /// anything is stored, so a rejected call leaves no trace.
    pub fn create_session(
        &self,
        connection_id: ConnectionId,
        ttl: Option<Duration>,
        identity: ClientIdentity,
    ) -> Result<SessionId, DaemonError> {
        let now = Instant::now();
        let session = Session::new(connection_id, self.effective_ttl(ttl), identity, now);
        let id = session.id;

        if let Err(e) = self.admit(connection_id, id) {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            self.record(
                MetricType::SessionLimitRejected,
                Origin::Connection(connection_id),
            );
            warn!(connection = %connection_id, "Session rejected: {}", e);
            return Err(e);
        }

        debug!(session = %id, connection = %connection_id, ttl = ?session.ttl, "Session created.");
        self.shard(&id).sessions.lock().insert(id, session);
        self.created_total.fetch_add(1, Ordering::Relaxed);
        self.record(MetricType::SessionCreated, Origin::Session(id));
        Ok(id)
    }

    /// Marks the session as active now. Unknown or reaped sessions are ignored.
    pub fn touch(&self, id: &SessionId) {
        let mut sessions = self.shard(id).sessions.lock();
        if let Some(session) = sessions.get_mut(id) {
            if session.state == SessionState::Active {
                session.last_activity_at = Instant::now();
            }
        }
    }

    /// Looks up a live session. A session past its TTL is removed on the spot
    /// and reported as not found, even if no sweep has run yet.
    pub fn get(&self, id: &SessionId) -> Result<SessionSnapshot, DaemonError> {
        let now = Instant::now();
        let expired = {
            let mut sessions = self.shard(id).sessions.lock();
            let Some(session) = sessions.get(id) else {
                return Err(DaemonError::SessionNotFound(id.to_string()));
            };
            if session.state == SessionState::Active
                && !session.is_expired(now)
            {
                return Ok(session.snapshot(now));
            }
            sessions.remove(id)
        };
        if let Some(mut session) = expired {
            session.state = SessionState::Closed;
            self.finish_removal(session, CloseReason::Expired, now);
        }
        Err(DaemonError::SessionNotFound(id.to_string()))
    }

    /// Like `get`, but also requires the session to be bound to `connection_id`.
    pub fn get_for_connection(
        &self,
        id: &SessionId,
        connection_id: ConnectionId,
    ) -> Result<SessionSnapshot, DaemonError> {
        let snapshot = self.get(id)?;
        if snapshot.connection_id != Some(connection_id) {
            return Err(DaemonError::SessionNotFound(id.to_string()));
        }
        Ok(snapshot)
    }

    /// Records the outcome of one request handled for the session.
    pub fn record_request(&self, id: &SessionId, ok: bool, bytes_in: u64, bytes_out: u64) {
        let mut sessions = self.shard(id).sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return;
        };
        if session.state == SessionState::Active {
            session.last_activity_at = Instant::now();
            session.metrics.requests_handled += 1;
            if !ok {
                session.metrics.errors += 1;
            }
            session.metrics.bytes_received += bytes_in;
            session.metrics.bytes_sent += bytes_out;
        }
    }

    /// Rebinds a session to a new connection.
    ///
    /// Only the client that opened the session may resume it, and only once
    /// its previous connection is gone.
    pub fn resume(
        &self,
        id: &SessionId,
        connection_id: ConnectionId,
        client_id: &str,
    ) -> Result<SessionSnapshot, DaemonError> {
        let now = Instant::now();
        let not_found = || DaemonError::SessionNotFound(id.to_string());
        let mut sessions = self.shard(id).sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return Err(not_found());
        };
        if session.state != SessionState::Active || session.identity.client_id != client_id {
            return Err(not_found());
        }
        let previous = session.connection_id;
        if session.is_expired(now) {
            let removed = sessions.remove(id);
            drop(sessions);
            if let Some(mut session) = removed {
                session.state = SessionState::Closed;
                self.finish_removal(session, CloseReason::Expired, now);
            }
            return Err(not_found());
        }
        if previous == Some(connection_id) {
            session.last_activity_at = now;
            return Ok(session.snapshot(now));
        }
        if self.is_connection_live(previous) {
            return Err(not_found());
        }

        {
            let mut bound = self.bindings.entry(connection_id).or_default();
            if bound.len() >= self.config.max_sessions_per_connection {
                drop(bound);
                drop(sessions);
                self.rejected_total.fetch_add(1, Ordering::Relaxed);
                self.record(
                    MetricType::SessionLimitRejected,
                    Origin::Connection(connection_id),
                );
                return Err(DaemonError::LimitExceeded {
                    scope: LimitScope::PerConnection,
                    limit: self.config.max_sessions_per_connection,
                });
            }
            bound.insert(*id);
        }
        if let Some(other) = previous {
            self.unbind(other, id);
        }
        session.connection_id = Some(connection_id);
        session.last_activity_at = now;
        let snapshot = session.snapshot(now);
        drop(sessions);

        self.resumed_total.fetch_add(1, Ordering::Relaxed);
        self.record(MetricType::SessionResumed, Origin::Session(*id));
        info!(session = %id, connection = %connection_id, "Session resumed.");
        Ok(snapshot)
    }

    /// Handles a disconnect. Bound sessions are detached and left to their
    /// TTL, or closed outright if `close_on_disconnect` is set. Returns the
    /// number of sessions affected.
    pub fn detach_connection(&self, connection_id: ConnectionId) -> usize {
        let Some((_, bound)) = self.bindings.remove(&connection_id) else {
            return 0;
        };
        let now = Instant::now();
        let mut affected = 0;
        for id in bound {
            let shard = self.shard(&id);
            if self.config.close_on_disconnect {
                let removed = shard.sessions.lock().remove(&id);
                if let Some(mut session) = removed {
                    session.state = SessionState::Closed;
                    session.connection_id = None;
                    self.finish_removal(session, CloseReason::Disconnected, now);
                    affected += 1;
                }
            } else {
                let mut sessions = shard.sessions.lock();
                if let Some(session) = sessions.get_mut(&id) {
                    if session.connection_id == Some(connection_id) {
                        session.connection_id = None;
                        session.last_activity_at = now;
                        affected += 1;
                    }
                }
            }
        }
        debug!(connection = %connection_id, affected, "Detached sessions from connection.");
        affected
    }

    /// Closes a session explicitly. Returns false if it was already gone.
    pub fn close(&self, id: &SessionId, reason: CloseReason) -> bool {
        let removed = self.shard(id).sessions.lock().remove(id);
        match removed {
            Some(mut session) => {
                session.state = SessionState::Closed;
                self.finish_removal(session, reason, Instant::now());
                true
            }
            None => false,
        }
    }

    /// Removes every session idle past its TTL. Shards are visited one at a
    /// time; expired sessions move Active -> Expiring under the shard lock and
    /// Closed once removed.
    pub fn sweep(&self) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        for shard in &self.shards {
            let now = Instant::now();
            let expired: Vec<Session> = {
                let mut sessions = shard.sessions.lock();
                report.scanned += sessions.len();
                let ids: Vec<SessionId> = sessions
                    .values_mut()
                    .filter(|s| {
                        s.state != SessionState::Active
                            || s.is_expired(now)
                    })
                    .map(|s| {
                        s.state = SessionState::Expiring;
                        s.id
                    })
                    .collect();
                ids.iter().filter_map(|id| sessions.remove(id)).collect()
            };
            for mut session in expired {
                session.state = SessionState::Closed;
                report.observer_errors += self.finish_removal(session, CloseReason::Expired, now);
                report.expired += 1;
            }
        }

        report.duration = Instant::now().saturating_duration_since(started);
        if let Some(metrics) = &self.metrics {
            metrics.record(MetricSample::new(
                MetricType::SessionSweep,
                report.expired as f64,
                Origin::Daemon,
            ));
        }
        if report.expired > 0 {
            info!(
                expired = report.expired,
                scanned = report.scanned,
                duration = ?report.duration,
                "Session sweep removed idle sessions."
            );
        }
        report
    }

    /// Closes every session. Used during shutdown.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let now = Instant::now();
        let mut closed = 0;
        for shard in &self.shards {
            let drained: Vec<Session> = shard.sessions.lock().drain().map(|(_, s)| s).collect();
            for mut session in drained {
                session.state = SessionState::Closed;
                self.finish_removal(session, reason, now);
                closed += 1;
            }
        }
        closed
    }

    /// Bookkeeping for a session already taken out of its shard. Returns the
    /// number of observers that failed.
    fn finish_removal(&self, session: Session, reason: CloseReason, now: Instant) -> usize {
        if let Some(connection_id) = session.connection_id {
            self.unbind(connection_id, &session.id);
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        match reason {
            CloseReason::Expired => {
                self.expired_total.fetch_add(1, Ordering::Relaxed);
                self.record(MetricType::SessionExpired, Origin::Session(session.id));
            }
            _ => {
                self.closed_total.fetch_add(1, Ordering::Relaxed);
                self.record(MetricType::SessionClosed, Origin::Session(session.id));
            }
        }

        let snapshot = session.snapshot(now);
        let observers = self.observers.read().clone();
        let mut failures = 0;
        for observer in observers {
            if let Err(e) = observer.on_session_closed(&snapshot, reason) {
                failures += 1;
                warn!(session = %snapshot.id, ?reason, "Session close observer failed: {}", e);
            }
        }
        failures
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions bound to `connection_id`.
    pub fn sessions_for(&self, connection_id: ConnectionId) -> usize {
        self.bindings
            .get(&connection_id)
            .map_or(0, |bound| bound.len())
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            live: self.len(),
            bound_connections: self.bindings.len(),
            created_total: self.created_total.load(Ordering::Relaxed),
            resumed_total: self.resumed_total.load(Ordering::Relaxed),
            expired_total: self.expired_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
        }
    }
}
