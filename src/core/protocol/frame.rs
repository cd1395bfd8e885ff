// src/core/protocol/frame.rs

//! Frame types exchanged with clients. Every WebSocket text message carries
//! exactly one frame, tagged by its `type` field.

use crate::core::DaemonError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The protocol version this daemon speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Opens (or resumes) a session on this connection.
    Handshake(HandshakeRequest),
    /// A request addressed to an established session.
    Request(RequestFrame),
    /// Closes a session explicitly.
    CloseSession { session_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol_version: u32,
    pub client_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Requested idle TTL. Clamped to the configured bounds.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// A previously issued session id to resume instead of creating a new one.
    #[serde(default)]
    pub resume_session: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlates the response with this request. Chosen by the client.
    pub id: String,
    pub session_id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Frames sent by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    HandshakeAck(HandshakeAck),
    Response(ResponseFrame),
    Event(EventFrame),
    /// A frame-level failure that cannot be correlated with a request.
    Error { error: ErrorBody },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub session_id: String,
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
    pub ttl_secs: u64,
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: &DaemonError) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error.to_error_body()),
        }
    }
}

/// An out-of-band notification, e.g. handler progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub payload: Value,
}

/// The structured error a client receives. It says enough to decide whether a
/// retry makes sense and nothing about daemon internals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    UnknownMethod,
    ProtocolMismatch,
    SessionNotFound,
    LimitExceeded,
    CircuitOpen,
    Timeout,
    Unavailable,
    ShuttingDown,
    Internal,
}

impl ClientFrame {
    /// Parses one text message into a frame.
    pub fn decode(text: &str) -> Result<Self, DaemonError> {
        serde_json::from_str(text).map_err(DaemonError::from)
    }
}

impl ServerFrame {
    /// Serializes the frame for the wire.
    pub fn encode(&self) -> Result<String, DaemonError> {
        serde_json::to_string(self)
            .map_err(|e| DaemonError::Internal(format!("failed to encode frame: {e}")))
    }

    pub fn error(error: &DaemonError) -> Self {
        ServerFrame::Error {
            error: error.to_error_body(),
        }
    }
}
