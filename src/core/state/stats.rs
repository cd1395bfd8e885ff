// src/core/state/stats.rs

//! Contains daemon-wide counters that do not belong to any single component.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the transport layer.
#[derive(Debug, Default)]
pub struct StatsState {
    /// WebSocket upgrades accepted since startup.
    total_connections: AtomicU64,
    /// Upgrades refused because `max_connections` was reached.
    rejected_connections: AtomicU64,
    /// Text frames read from clients.
    frames_received: AtomicU64,
    /// Frames that failed to decode or exceeded the size limit.
    malformed_frames: AtomicU64,
    /// Handshakes that completed with a session.
    handshakes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub handshakes: u64,
}

impl StatsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_total_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected_connections(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_malformed_frames(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handshakes(&self) {
        self.handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
        }
    }
}
