// src/core/router/dispatcher.rs

//! The `RequestRouter` takes a decoded request from a connection and turns it
//! into exactly one response frame.
//!
//! Every request goes through the same pipeline:
//!
//! 1. Refuse new work once shutdown has begun.
//! 2. Resolve the session, which must be live and bound to the calling connection.
//! 3. Resolve the handler for the method.
//! 4. Run the handler through the retry executor and circuit breaker keyed
//!    `route:<method>`, each attempt bounded by the handler timeout and the
//!    whole dispatch by the daemon timeout.
//! 5. Classify the outcome into a response frame and update session metrics.
//!
//! No lock is held while a handler runs; handlers get a session snapshot.

use super::handler::{Deadline, HandlerRegistry, HandlerRequest, ProgressReporter};
use super::request::{InFlightRequest, RequestState};
use super::timeouts::TimeoutHierarchy;
use crate::config::RetryConfig;
use crate::core::DaemonError;
use crate::core::protocol::ResponseFrame;
use crate::core::resilience::{Fallback, RetryExecutor, RetryPolicy};
use crate::core::session::SessionManager;
use crate::core::telemetry::{MetricSample, MetricType, MetricsCollector};
use crate::core::types::{ConnectionId, Origin, SessionId};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info_span, warn};

/// A request as decoded from the wire, tagged with the connection it came from.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub connection_id: ConnectionId,
    pub id: String,
    pub method: String,
    pub params: Value,
    /// Size of the frame that carried the request.
    pub size_bytes: u64,
}

pub struct RequestRouter {
    sessions: Arc<SessionManager>,
    executor: RetryExecutor,
    registry: HandlerRegistry,
    timeouts: TimeoutHierarchy,
    default_policy: RetryPolicy,
    metrics: Option<Arc<MetricsCollector>>,
    shutting_down: AtomicBool,
    in_flight: DashMap<u64, Arc<InFlightRequest>>,
    next_seq: AtomicU64,
}

impl RequestRouter {
    /// Builds a router. Fails if the timeout hierarchy is not strictly increasing.
    pub fn new(
        sessions: Arc<SessionManager>,
        executor: RetryExecutor,
        registry: HandlerRegistry,
        timeouts: TimeoutHierarchy,
        retry: &RetryConfig,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self, DaemonError> {
        timeouts.validate()?;
        Ok(Self {
            sessions,
            executor,
            registry,
            default_policy: RetryPolicy::from_config(retry, timeouts.handler),
            timeouts,
            metrics,
            shutting_down: AtomicBool::new(false),
            in_flight: DashMap::new(),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn timeouts(&self) -> &TimeoutHierarchy {
        &self.timeouts
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    fn record(&self, sample: MetricSample) {
        if let Some(metrics) = &self.metrics {
            metrics.record(sample);
        }
    }

    /// Dispatches one request. Always produces a response; failures are
    /// encoded in it.
    pub async fn dispatch(
        &self,
        session_id: &str,
        request: InboundRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> ResponseFrame {
        let span = info_span!(
            "request",
            id = %request.id,
            method = %request.method,
            connection = %request.connection_id,
        );
        self.dispatch_inner(session_id, request, progress)
            .instrument(span)
            .await
    }

    async fn dispatch_inner(
        &self,
        session_id: &str,
        request: InboundRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> ResponseFrame {
        if self.is_shutting_down() {
            return self.reject(&request, DaemonError::ShuttingDown);
        }

        let Ok(sid) = SessionId::from_str(session_id) else {
            return self.reject(
                &request,
                DaemonError::SessionNotFound(session_id.to_string()),
            );
        };
        let snapshot = match self.sessions.get_for_connection(&sid, request.connection_id) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.reject(&request, e),
        };
        let Some(route) = self.registry.route(&request.method).cloned() else {
            self.sessions
                .record_request(&sid, false, request.size_bytes, 0);
            return self.reject(&request, DaemonError::UnknownMethod(request.method.clone()));
        };

        let tracked = Arc::new(InFlightRequest::new(
            request.id.clone(),
            request.method.clone(),
            sid,
            request.connection_id,
        ));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(seq, Arc::clone(&tracked));
        let in_flight = InFlightGuard {
            map: &self.in_flight,
            seq,
        };

        let deadline = Deadline::new(
            tracked.received_at + self.timeouts.daemon,
            tracked.token().child_token(),
        );
        let policy = route.policy.clone().unwrap_or_else(|| self.default_policy.clone());
        let operation = format!("route:{}", request.method);
        let _ = tracked.transition(RequestState::Dispatched);
        self.sessions.touch(&sid);

        let handler = Arc::clone(&route.handler);
        let base_request = HandlerRequest {
            id: request.id.clone(),
            method: request.method.clone(),
            params: request.params.clone(),
            attempt: 0,
        };
        let primary = {
            let handler = Arc::clone(&handler);
            let base_request = base_request.clone();
            let snapshot = snapshot.clone();
            let deadline = deadline.clone();
            let progress = Arc::clone(&progress);
            move |attempt: u32| {
                let handler = Arc::clone(&handler);
                let request = HandlerRequest {
                    attempt,
                    ..base_request.clone()
                };
                let snapshot = snapshot.clone();
                let deadline = deadline.clone();
                let progress = Arc::clone(&progress);
                async move {
                    AssertUnwindSafe(handler.handle(request, snapshot, deadline, progress))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let reason = panic_message(&*panic);
                            error!("Handler panicked: {}", reason);
                            Err(DaemonError::Internal(format!("handler panicked: {reason}")))
                        })
                }
            }
        };
        let fallback: Fallback<Value> = {
            let handler = Arc::clone(&handler);
            Box::new(move |error: DaemonError| {
                async move {
                    match handler.fallback(&base_request, &error) {
                        Some(value) => Ok(value),
                        None => Err(error),
                    }
                }
                .boxed()
            })
        };

        let run = self.executor.run(
            &operation,
            &policy,
            Some(deadline.at()),
            primary,
            Some(fallback),
            tracked.as_ref(),
        );
        let outcome = tokio::select! {
            result = run => result,
            _ = tracked.token().cancelled() => Err(DaemonError::Cancelled),
        };
        deadline.token().cancel();
        drop(in_flight);

        let latency = tracked.elapsed();
        let origin = Origin::Session(sid);
        match outcome {
            Ok(value) => {
                let response = ResponseFrame::success(request.id, value);
                let bytes_out = response_size(&response);
                let _ = tracked.transition(RequestState::Completed);
                self.sessions
                    .record_request(&sid, true, request.size_bytes, bytes_out);
                self.record(MetricSample::new(MetricType::RequestCompleted, 1.0, origin));
                self.record(MetricSample::new(
                    MetricType::RequestLatency,
                    latency.as_secs_f64() * 1000.0,
                    origin,
                ));
                debug!(?latency, "Request completed.");
                response
            }
            Err(error) => {
                let abandoned = matches!(error, DaemonError::Cancelled)
                    || (matches!(error, DaemonError::Timeout { .. })
                        && Instant::now() >= deadline.at());
                if abandoned {
                    let _ = tracked.transition(RequestState::Cancelled);
                    self.record(MetricSample::new(MetricType::RequestCancelled, 1.0, origin));
                } else {
                    let _ = tracked.transition(RequestState::Failed);
                    self.record(MetricSample::new(MetricType::RequestFailed, 1.0, origin));
                }
                warn!(?latency, code = ?error.code(), "Request failed: {}", error);
                let response = ResponseFrame::failure(request.id, &error);
                self.sessions.record_request(
                    &sid,
                    false,
                    request.size_bytes,
                    response_size(&response),
                );
                response
            }
        }
    }

    /// Rejects a request before it reaches a handler.
    fn reject(&self, request: &InboundRequest, error: DaemonError) -> ResponseFrame {
        debug!(code = ?error.code(), "Request rejected: {}", error);
        self.record(MetricSample::new(
            MetricType::RequestFailed,
            1.0,
            Origin::Connection(request.connection_id),
        ));
        ResponseFrame::failure(request.id.clone(), &error)
    }

    /// Cancels every in-flight request from `connection_id`. Returns how many
    /// were cancelled.
    pub fn cancel_connection(&self, connection_id: ConnectionId) -> usize {
        let mut cancelled = 0;
        for entry in self.in_flight.iter() {
            if entry.value().connection_id == connection_id {
                entry.value().cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Stops accepting requests. In-flight requests continue.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Cancels everything still running. Used at the end of shutdown.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.in_flight.iter() {
            entry.value().cancel();
            cancelled += 1;
        }
        cancelled
    }
}

/// Removes a request from the in-flight table however its dispatch ends.
struct InFlightGuard<'a> {
    map: &'a DashMap<u64, Arc<InFlightRequest>>,
    seq: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.seq);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn response_size(response: &ResponseFrame) -> u64 {
    serde_json::to_vec(response).map_or(0, |bytes| bytes.len() as u64)
}
