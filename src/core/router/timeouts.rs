// src/core/router/timeouts.rs

use crate::core::DaemonError;
use std::time::Duration;

/// Timeouts of every layer between a handler and the end client. Each layer
/// must give up strictly later than the one it wraps, so the innermost
/// failure is always the one reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHierarchy {
    /// One handler attempt.
    pub handler: Duration,
    /// One whole dispatch, retries and backoff included.
    pub daemon: Duration,
    pub transport_shim: Duration,
    pub client: Duration,
}

impl TimeoutHierarchy {
    /// Derives the standard 1.0x / 1.5x / 2.0x / 2.5x ladder from a handler timeout.
    pub fn from_handler(handler: Duration) -> Self {
        Self {
            handler,
            daemon: handler.mul_f64(1.5),
            transport_shim: handler.mul_f64(2.0),
            client: handler.mul_f64(2.5),
        }
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.handler.is_zero() {
            return Err(DaemonError::Config("handler timeout cannot be 0".into()));
        }
        let ladder = [
            ("handler", self.handler),
            ("daemon", self.daemon),
            ("transport_shim", self.transport_shim),
            ("client", self.client),
        ];
        for pair in ladder.windows(2) {
            let (inner_name, inner) = pair[0];
            let (outer_name, outer) = pair[1];
            if outer <= inner {
                return Err(DaemonError::Config(format!(
                    "{outer_name} timeout ({outer:?}) must exceed {inner_name} timeout ({inner:?})"
                )));
            }
        }
        Ok(())
    }
}

impl Default for TimeoutHierarchy {
    fn default() -> Self {
        Self::from_handler(Duration::from_secs(30))
    }
}
