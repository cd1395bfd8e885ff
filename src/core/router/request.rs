// src/core/router/request.rs

//! The lifecycle of one dispatched request.

use crate::core::DaemonError;
use crate::core::resilience::RetryListener;
use crate::core::types::{ConnectionId, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// ```text
/// RECEIVED -> DISPATCHED -> (RETRYING)* -> COMPLETED | FAILED | CANCELLED
/// ```
///
/// `FAILED` and `CANCELLED` are also reachable straight from `RECEIVED`
/// (rejected before dispatch, or abandoned while queued).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RequestState {
    Received,
    Dispatched,
    Retrying { attempt: u32 },
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }

    fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Received, Dispatched | Failed | Cancelled) => true,
            (Dispatched | Retrying { .. }, Retrying { .. } | Completed | Failed | Cancelled) => {
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct InFlightRequest {
    pub request_id: String,
    pub method: String,
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub received_at: Instant,
    token: CancellationToken,
    history: Mutex<Vec<RequestState>>,
}

impl InFlightRequest {
    pub fn new(
        request_id: impl Into<String>,
        method: impl Into<String>,
        session_id: SessionId,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method: method.into(),
            session_id,
            connection_id,
            received_at: Instant::now(),
            token: CancellationToken::new(),
            history: Mutex::new(vec![RequestState::Received]),
        }
    }

    pub fn state(&self) -> RequestState {
        self.history
            .lock()
            .last()
            .copied()
            .unwrap_or(RequestState::Received)
    }

    /// Every state the request has passed through, in order.
    pub fn history(&self) -> Vec<RequestState> {
        self.history.lock().clone()
    }

    pub fn transition(&self, next: RequestState) -> Result<(), DaemonError> {
        let mut history = self.history.lock();
        let current = history.last().copied().unwrap_or(RequestState::Received);
        if !current.can_transition_to(next) {
            return Err(DaemonError::InvariantViolation(format!(
                "request '{}' cannot move from {:?} to {:?}",
                self.request_id, current, next
            )));
        }
        history.push(next);
        Ok(())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Abandons the request. Its handler sees the cancellation through its deadline.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.received_at)
    }
}

impl RetryListener for InFlightRequest {
    fn on_retry(&self, retry: u32, delay: Duration, error: &DaemonError) {
        debug!(
            request = %self.request_id,
            method = %self.method,
            retry,
            ?delay,
            "Retrying request after: {}", error
        );
        // A request cancelled mid-backoff stays cancelled.
        let _ = self.transition(RequestState::Retrying { attempt: retry });
    }
}
