// src/core/session/types.rs

//! Session records and the views handed out to the rest of the daemon.

use crate::core::DaemonError;
use crate::core::protocol::Capabilities;
use crate::core::types::{ConnectionId, SessionId};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    /// Selected for removal by a sweep; no longer served.
    Expiring,
    Closed,
}

/// Per-session request accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub requests_handled: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Who opened the session and what it negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub capabilities: Capabilities,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            client_id: client_id.into(),
            capabilities,
        }
    }
}

/// The stored record. Only the session manager touches it, under its shard lock.
#[derive(Debug)]
pub(crate) struct Session {
    pub id: SessionId,
    /// The connection currently bound to the session, if any. A lookup key
    /// only: the session never holds the connection itself.
    pub connection_id: Option<ConnectionId>,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub ttl: Duration,
    pub state: SessionState,
    pub metrics: SessionMetrics,
    pub identity: ClientIdentity,
}

impl Session {
    pub fn new(
        connection_id: ConnectionId,
        ttl: Duration,
        identity: ClientIdentity,
        now: Instant,
    ) -> Self {
        Self {
            id: SessionId::new(),
            connection_id: Some(connection_id),
            created_at: now,
            last_activity_at: now,
            ttl,
            state: SessionState::Active,
            metrics: SessionMetrics::default(),
            identity,
        }
    }

    /// True if the session has gone untouched for longer than its TTL.
    /// Traffic for other sessions on the same connection does not count.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity_at) > self.ttl
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            connection_id: self.connection_id,
            client_id: self.identity.client_id.clone(),
            capabilities: self.identity.capabilities,
            state: self.state,
            ttl: self.ttl,
            age: now.saturating_duration_since(self.created_at),
            idle: now.saturating_duration_since(self.last_activity_at),
            metrics: self.metrics,
        }
    }
}

/// An immutable copy of a session, safe to hold across await points.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub connection_id: Option<ConnectionId>,
    pub client_id: String,
    pub capabilities: Capabilities,
    pub state: SessionState,
    pub ttl: Duration,
    pub age: Duration,
    pub idle: Duration,
    pub metrics: SessionMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Expired,
    Explicit,
    Disconnected,
    Shutdown,
}

/// The outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub observer_errors: usize,
    pub duration: Duration,
}

/// Notified when a session is closed for any reason.
pub trait SessionObserver: Send + Sync {
    fn on_session_closed(
        &self,
        session: &SessionSnapshot,
        reason: CloseReason,
    ) -> Result<(), DaemonError>;
}

/// Reports transport-level liveness of a connection.
pub trait LivenessProbe: Send + Sync {
    /// The last read or write on the connection, or `None` if it is gone.
    fn last_activity(&self, connection_id: ConnectionId) -> Option<Instant>;
}

/// Counters describing the session table.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionStats {
    pub live: usize,
    pub bound_connections: usize,
    pub created_total: u64,
    pub resumed_total: u64,
    pub expired_total: u64,
    pub closed_total: u64,
    pub rejected_total: u64,
}
