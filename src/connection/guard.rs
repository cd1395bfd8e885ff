// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource management.

use crate::core::state::DaemonState;
use crate::core::types::ConnectionId;
use std::sync::Arc;
use tracing::debug;

/// Releases everything a connection holds: in-flight requests, session
/// bindings and the registration with the connection manager.
///
/// The handler calls `release` on its normal exit path. If the handler future
/// is dropped instead (task aborted, panic), `Drop` spawns the same cleanup.
pub struct ConnectionGuard {
    state: Arc<DaemonState>,
    id: ConnectionId,
    released: bool,
}

impl ConnectionGuard {
    pub(crate) fn new(state: Arc<DaemonState>, id: ConnectionId) -> Self {
        Self {
            state,
            id,
            released: false,
        }
    }

    /// Cancels the connection's in-flight requests. Safe to call repeatedly.
    pub(crate) fn cancel_requests(&self) -> usize {
        self.state.router.cancel_connection(self.id)
    }

    /// Runs the cleanup and disarms the guard.
    pub(crate) async fn release(mut self) {
        self.released = true;
        cleanup(Arc::clone(&self.state), self.id).await;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!(connection = %self.id, "ConnectionGuard dropped without release; cleaning up.");
        let state = Arc::clone(&self.state);
        let id = self.id;
        state.router.cancel_connection(id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(cleanup(state, id));
        } else {
            state.sessions.detach_connection(id);
        }
    }
}

async fn cleanup(state: Arc<DaemonState>, id: ConnectionId) {
    let cancelled = state.router.cancel_connection(id);
    let detached = state.sessions.detach_connection(id);
    let report = state.connections.unregister_default(id).await;
    debug!(
        connection = %id,
        cancelled,
        detached,
        flushed = report.map_or(0, |r| r.flushed),
        "Connection resources released."
    );
}
