// src/core/router/handler.rs

//! The interface between the router and the code that actually serves a method.

use crate::core::DaemonError;
use crate::core::resilience::RetryPolicy;
use crate::core::session::SessionSnapshot;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The point in time by which a request must be answered, plus a token that
/// fires when the request is abandoned (deadline passed or client gone).
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    token: CancellationToken,
}

impl Deadline {
    pub fn new(at: Instant, token: CancellationToken) -> Self {
        Self { at, token }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::new(Instant::now() + timeout, CancellationToken::new())
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.at
    }

    /// Completes when the request is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Out-of-band progress reporting for long-running handlers.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, payload: Value);
}

/// Discards progress reports.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _payload: Value) {}
}

/// The request as a handler sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRequest {
    pub id: String,
    pub method: String,
    pub params: Value,
    /// Zero for the first attempt, incremented on every retry.
    pub attempt: u32,
}

/// Serves one method.
///
/// Handlers receive everything by value and hold no daemon lock while they
/// run. A handler that wants retries signals a transient failure with a
/// retryable error (see `DaemonError::transient`).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        request: HandlerRequest,
        session: SessionSnapshot,
        deadline: Deadline,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Value, DaemonError>;

    /// A degraded answer used when the breaker is open or retries are exhausted.
    fn fallback(&self, _request: &HandlerRequest, _error: &DaemonError) -> Option<Value> {
        None
    }
}

#[derive(Clone)]
pub(crate) struct Route {
    pub handler: Arc<dyn Handler>,
    pub policy: Option<RetryPolicy>,
}

/// Maps method names onto handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    routes: HashMap<String, Route>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `method`, replacing any previous handler.
    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.routes.insert(
            method.into(),
            Route {
                handler,
                policy: None,
            },
        );
        self
    }

    /// Registers `handler` with a retry policy that overrides the daemon default.
    pub fn register_with_policy(
        &mut self,
        method: impl Into<String>,
        handler: Arc<dyn Handler>,
        policy: RetryPolicy,
    ) -> &mut Self {
        self.routes.insert(
            method.into(),
            Route {
                handler,
                policy: Some(policy),
            },
        );
        self
    }

    pub(crate) fn route(&self, method: &str) -> Option<&Route> {
        self.routes.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.routes.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.routes.keys().cloned().collect();
        methods.sort();
        methods
    }
}
