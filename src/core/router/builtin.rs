// src/core/router/builtin.rs

//! Methods every daemon serves regardless of which tool handlers are plugged in.

use super::handler::{Deadline, Handler, HandlerRegistry, HandlerRequest, ProgressReporter};
use crate::core::DaemonError;
use crate::core::protocol::Capabilities;
use crate::core::session::SessionSnapshot;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// `ping`: answers immediately with the daemon's wall-clock time.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(
        &self,
        _request: HandlerRequest,
        _session: SessionSnapshot,
        _deadline: Deadline,
        _progress: Arc<dyn ProgressReporter>,
    ) -> Result<Value, DaemonError> {
        Ok(json!({
            "pong": true,
            "time": chrono::Utc::now().to_rfc3339(),
        }))
    }
}

/// `echo`: returns its params. Sessions that negotiated `progress` also get
/// one progress event first.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(
        &self,
        request: HandlerRequest,
        session: SessionSnapshot,
        _deadline: Deadline,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Value, DaemonError> {
        if session.capabilities.contains(Capabilities::PROGRESS) {
            progress.report(json!({ "stage": "echoing", "percent": 50 }));
        }
        Ok(request.params)
    }
}

/// `session.info`: describes the calling session.
pub struct SessionInfoHandler;

#[async_trait]
impl Handler for SessionInfoHandler {
    async fn handle(
        &self,
        _request: HandlerRequest,
        session: SessionSnapshot,
        deadline: Deadline,
        _progress: Arc<dyn ProgressReporter>,
    ) -> Result<Value, DaemonError> {
        Ok(json!({
            "session_id": session.id.to_string(),
            "client_id": session.client_id,
            "capabilities": session.capabilities.names(),
            "ttl_secs": session.ttl.as_secs(),
            "age_ms": session.age.as_millis() as u64,
            "idle_ms": session.idle.as_millis() as u64,
            "requests_handled": session.metrics.requests_handled,
            "errors": session.metrics.errors,
            "bytes_sent": session.metrics.bytes_sent,
            "bytes_received": session.metrics.bytes_received,
            "deadline_ms": deadline.remaining().as_millis() as u64,
        }))
    }
}

/// Adds the built-in methods to `registry`.
pub fn register_builtin(registry: &mut HandlerRegistry) {
    registry
        .register("ping", Arc::new(PingHandler))
        .register("echo", Arc::new(EchoHandler))
        .register("session.info", Arc::new(SessionInfoHandler));
}
