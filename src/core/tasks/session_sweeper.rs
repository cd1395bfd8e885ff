// src/core/tasks/session_sweeper.rs

use crate::core::session::SessionManager;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Periodically removes sessions that have been idle past their TTL.
///
/// Lookups already expire sessions lazily; the sweeper reclaims the ones
/// nobody asks about again.
pub struct SessionSweeper {
    sessions: Arc<SessionManager>,
}

impl SessionSweeper {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.sessions.sweep_interval();
        info!("Session sweeper started. Interval: {:?}", period);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sessions.sweep();
                    if report.expired > 0 {
                        debug!(
                            scanned = report.scanned,
                            expired = report.expired,
                            duration = ?report.duration,
                            "Session sweep removed expired sessions."
                        );
                    }
                    if report.observer_errors > 0 {
                        warn!(
                            errors = report.observer_errors,
                            "Session observers failed during sweep."
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Session sweeper shutting down.");
                    return;
                }
            }
        }
    }
}
