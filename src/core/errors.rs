// src/core/errors.rs

//! Defines the primary error type for the daemon and its client-facing classification.

use crate::core::protocol::{ErrorBody, ErrorCode};
use crate::core::types::ConnectionId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Which cap a `LimitExceeded` error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// The process-wide session cap.
    Global,
    /// The per-connection session cap.
    PerConnection,
    /// The per-connection in-flight request cap.
    InFlight,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitScope::Global => write!(f, "global session"),
            LimitScope::PerConnection => write!(f, "per-connection session"),
            LimitScope::InFlight => write!(f, "in-flight request"),
        }
    }
}

/// The main error enum, representing all possible failures within the daemon.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("{scope} limit of {limit} exceeded")]
    LimitExceeded { scope: LimitScope, limit: usize },

    #[error("Circuit open for '{operation}'")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    #[error("Operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Upstream '{operation}' failed: {message}")]
    Upstream {
        operation: String,
        message: String,
        retryable: bool,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown method '{0}'")]
    UnknownMethod(String),

    #[error("Protocol mismatch: expected version {expected}, got {got}")]
    ProtocolMismatch { expected: u32, got: u32 },

    #[error("Daemon is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// `std::io::Error` is not cloneable, so it is shared behind an Arc.
impl Clone for DaemonError {
    fn clone(&self) -> Self {
        match self {
            DaemonError::Io(e) => DaemonError::Io(Arc::clone(e)),
            DaemonError::Transport(s) => DaemonError::Transport(s.clone()),
            DaemonError::DuplicateConnection(id) => DaemonError::DuplicateConnection(*id),
            DaemonError::ConnectionNotFound(id) => DaemonError::ConnectionNotFound(*id),
            DaemonError::ConnectionClosed(id) => DaemonError::ConnectionClosed(*id),
            DaemonError::SessionNotFound(s) => DaemonError::SessionNotFound(s.clone()),
            DaemonError::LimitExceeded { scope, limit } => DaemonError::LimitExceeded {
                scope: *scope,
                limit: *limit,
            },
            DaemonError::CircuitOpen {
                operation,
                retry_after,
            } => DaemonError::CircuitOpen {
                operation: operation.clone(),
                retry_after: *retry_after,
            },
            DaemonError::Timeout { operation, after } => DaemonError::Timeout {
                operation: operation.clone(),
                after: *after,
            },
            DaemonError::Cancelled => DaemonError::Cancelled,
            DaemonError::Upstream {
                operation,
                message,
                retryable,
            } => DaemonError::Upstream {
                operation: operation.clone(),
                message: message.clone(),
                retryable: *retryable,
            },
            DaemonError::InvalidRequest(s) => DaemonError::InvalidRequest(s.clone()),
            DaemonError::UnknownMethod(s) => DaemonError::UnknownMethod(s.clone()),
            DaemonError::ProtocolMismatch { expected, got } => DaemonError::ProtocolMismatch {
                expected: *expected,
                got: *got,
            },
            DaemonError::ShuttingDown => DaemonError::ShuttingDown,
            DaemonError::Config(s) => DaemonError::Config(s.clone()),
            DaemonError::InvariantViolation(s) => DaemonError::InvariantViolation(s.clone()),
            DaemonError::Internal(s) => DaemonError::Internal(s.clone()),
        }
    }
}

impl PartialEq for DaemonError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DaemonError::Io(e1), DaemonError::Io(e2)) => e1.to_string() == e2.to_string(),
            (DaemonError::Transport(s1), DaemonError::Transport(s2)) => s1 == s2,
            (DaemonError::DuplicateConnection(a), DaemonError::DuplicateConnection(b)) => a == b,
            (DaemonError::ConnectionNotFound(a), DaemonError::ConnectionNotFound(b)) => a == b,
            (DaemonError::ConnectionClosed(a), DaemonError::ConnectionClosed(b)) => a == b,
            (DaemonError::SessionNotFound(a), DaemonError::SessionNotFound(b)) => a == b,
            (
                DaemonError::LimitExceeded { scope: s1, limit: l1 },
                DaemonError::LimitExceeded { scope: s2, limit: l2 },
            ) => s1 == s2 && l1 == l2,
            (
                DaemonError::CircuitOpen { operation: o1, .. },
                DaemonError::CircuitOpen { operation: o2, .. },
            ) => o1 == o2,
            (
                DaemonError::Timeout { operation: o1, .. },
                DaemonError::Timeout { operation: o2, .. },
            ) => o1 == o2,
            (
                DaemonError::Upstream {
                    operation: o1,
                    message: m1,
                    ..
                },
                DaemonError::Upstream {
                    operation: o2,
                    message: m2,
                    ..
                },
            ) => o1 == o2 && m1 == m2,
            (DaemonError::InvalidRequest(a), DaemonError::InvalidRequest(b)) => a == b,
            (DaemonError::UnknownMethod(a), DaemonError::UnknownMethod(b)) => a == b,
            (DaemonError::Config(a), DaemonError::Config(b)) => a == b,
            (DaemonError::InvariantViolation(a), DaemonError::InvariantViolation(b)) => a == b,
            (DaemonError::Internal(a), DaemonError::Internal(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl DaemonError {
    /// Shorthand for a retryable upstream failure.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        DaemonError::Upstream {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Returns true if the failure is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DaemonError::Io(_)
            | DaemonError::Transport(_)
            | DaemonError::Timeout { .. }
            | DaemonError::Cancelled => true,
            DaemonError::Upstream { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Maps the error onto the code a client sees.
    pub fn code(&self) -> ErrorCode {
        match self {
            DaemonError::Io(_) | DaemonError::Transport(_) => ErrorCode::Unavailable,
            DaemonError::Upstream { .. } => ErrorCode::Unavailable,
            DaemonError::DuplicateConnection(_)
            | DaemonError::ConnectionNotFound(_)
            | DaemonError::ConnectionClosed(_) => ErrorCode::Unavailable,
            DaemonError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            DaemonError::LimitExceeded { .. } => ErrorCode::LimitExceeded,
            DaemonError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            DaemonError::Timeout { .. } | DaemonError::Cancelled => ErrorCode::Timeout,
            DaemonError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            DaemonError::UnknownMethod(_) => ErrorCode::UnknownMethod,
            DaemonError::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            DaemonError::ShuttingDown => ErrorCode::ShuttingDown,
            DaemonError::Config(_)
            | DaemonError::InvariantViolation(_)
            | DaemonError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Builds the client-facing error body. Internal details and raw upstream
    /// payloads are replaced by generic messages.
    pub fn to_error_body(&self) -> ErrorBody {
        let message = match self {
            DaemonError::Io(_) | DaemonError::Transport(_) => "transport failure".to_string(),
            DaemonError::Upstream { operation, .. } => {
                format!("upstream '{operation}' is unavailable")
            }
            DaemonError::Config(_)
            | DaemonError::InvariantViolation(_)
            | DaemonError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let retry_after_ms = match self {
            DaemonError::CircuitOpen { retry_after, .. } => Some(retry_after.as_millis() as u64),
            _ => None,
        };
        ErrorBody {
            code: self.code(),
            message,
            retryable: self.is_retryable() || matches!(self, DaemonError::CircuitOpen { .. }),
            retry_after_ms,
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for DaemonError {
    fn from(e: std::io::Error) -> Self {
        DaemonError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::InvalidRequest(format!("malformed JSON: {e}"))
    }
}

impl From<axum::Error> for DaemonError {
    fn from(e: axum::Error) -> Self {
        DaemonError::Transport(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DaemonError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DaemonError::Timeout {
            operation: "unknown".to_string(),
            after: Duration::ZERO,
        }
    }
}
