// src/connection/handler.rs

//! Defines the `ConnectionHandler`, which reads client frames from one
//! WebSocket and turns them into handshakes, dispatched requests and session
//! closes.
//!
//! The handler only ever reads. Everything it sends goes through the
//! connection manager's outbound queue, the same path responses from
//! dispatched requests take.

use super::guard::ConnectionGuard;
use super::manager::{ConnectionManager, ConnectionRegistration};
use super::sink::WebSocketSink;
use crate::core::DaemonError;
use crate::core::errors::LimitScope;
use crate::core::protocol::{
    Capabilities, ClientFrame, EventFrame, HandshakeAck, HandshakeRequest, PROTOCOL_VERSION,
    RequestFrame, ResponseFrame, ServerFrame,
};
use crate::core::router::{InboundRequest, ProgressReporter};
use crate::core::session::{ClientIdentity, CloseReason};
use crate::core::state::DaemonState;
use crate::core::telemetry::{MetricSample, MetricType};
use crate::core::types::{ConnectionId, Origin, SessionId};
use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use futures::stream::SplitStream;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the read loop does after a frame.
enum NextAction {
    Continue,
    Close,
}

/// Manages the read side of one client connection.
pub struct ConnectionHandler {
    id: ConnectionId,
    addr: SocketAddr,
    state: Arc<DaemonState>,
    stream: SplitStream<WebSocket>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Bounds concurrently dispatched requests from this connection.
    in_flight: Arc<Semaphore>,
    requests: JoinSet<()>,
    /// Set until the first successful handshake.
    handshake_deadline: Option<Instant>,
}

impl ConnectionHandler {
    /// Splits the socket and registers its write half with the connection
    /// manager.
    pub fn accept(
        socket: WebSocket,
        addr: SocketAddr,
        state: Arc<DaemonState>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self, DaemonError> {
        let (sink, stream) = socket.split();
        let id = state.connections.register(ConnectionRegistration {
            transport_key: addr.to_string(),
            sink: Box::new(WebSocketSink::new(sink)),
        })?;
        let config = &state.config.connection;
        Ok(Self {
            id,
            addr,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight_requests.max(1))),
            handshake_deadline: Some(Instant::now() + config.handshake_timeout),
            state,
            stream,
            shutdown_rx,
            requests: JoinSet::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The main event loop for the connection.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        let guard = ConnectionGuard::new(Arc::clone(&self.state), self.id);
        info!(connection = %self.id, addr = %self.addr, "Client connected.");
        let mut shutting_down = false;

        loop {
            let handshake_expiry = self.handshake_deadline;
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    debug!(connection = %self.id, "Connection handler received shutdown signal.");
                    shutting_down = true;
                    break;
                }
                _ = sleep_until_opt(handshake_expiry), if handshake_expiry.is_some() => {
                    let timeout = self.state.config.connection.handshake_timeout;
                    warn!(connection = %self.id, ?timeout, "No handshake received in time; closing.");
                    self.send(&ServerFrame::error(&DaemonError::Timeout {
                        operation: "handshake".to_string(),
                        after: timeout,
                    }));
                    break;
                }
                Some(joined) = self.requests.join_next(), if !self.requests.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(connection = %self.id, "A request task panicked: {e:?}");
                        }
                    }
                }
                message = self.stream.next() => {
                    let action = match message {
                        Some(Ok(message)) => self.process_message(message),
                        Some(Err(e)) => {
                            debug!(connection = %self.id, "Connection closed with error: {}", e);
                            NextAction::Close
                        }
                        None => {
                            debug!(connection = %self.id, "Connection closed by peer.");
                            NextAction::Close
                        }
                    };
                    if let NextAction::Close = action {
                        break;
                    }
                }
            }
        }

        // On a disconnect nobody is left to read the responses. During
        // shutdown the coordinator lets them finish within the grace period.
        if !shutting_down {
            let cancelled = guard.cancel_requests();
            if cancelled > 0 {
                debug!(connection = %self.id, cancelled, "Cancelled in-flight requests.");
            }
        }
        while self.requests.join_next().await.is_some() {}

        guard.release().await;
        info!(connection = %self.id, addr = %self.addr, "Client disconnected.");
        Ok(())
    }

    fn process_message(&mut self, message: Message) -> NextAction {
        let text = match message {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    self.reject_frame(DaemonError::InvalidRequest(
                        "binary frames must contain UTF-8 JSON".to_string(),
                    ));
                    return NextAction::Continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => return NextAction::Continue,
            Message::Close(_) => return NextAction::Close,
        };
        // Keep-alive control frames do not count as activity.
        self.state.connections.mark_active(self.id);

        self.state.stats.increment_frames_received();
        self.record(MetricType::FrameReceived, text.len() as f64);

        let limit = self.state.config.connection.max_frame_bytes;
        if text.len() > limit {
            self.reject_frame(DaemonError::InvalidRequest(format!(
                "frame of {} bytes exceeds the {limit} byte limit",
                text.len()
            )));
            return NextAction::Continue;
        }

        let frame = match ClientFrame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject_frame(e);
                return NextAction::Continue;
            }
        };

        match frame {
            ClientFrame::Handshake(request) => self.process_handshake(request),
            ClientFrame::Request(request) => {
                self.process_request(request, &text);
                NextAction::Continue
            }
            ClientFrame::CloseSession { session_id } => {
                self.process_close_session(&session_id);
                NextAction::Continue
            }
        }
    }

    fn process_handshake(&mut self, request: HandshakeRequest) -> NextAction {
        match self.handshake(request) {
            Ok(ack) => {
                self.handshake_deadline = None;
                self.state.stats.increment_handshakes();
                self.send(&ServerFrame::HandshakeAck(ack));
                NextAction::Continue
            }
            Err(e) => {
                debug!(connection = %self.id, "Handshake rejected: {}", e);
                self.send(&ServerFrame::error(&e));
                // A client speaking another protocol version cannot recover.
                if matches!(e, DaemonError::ProtocolMismatch { .. }) {
                    NextAction::Close
                } else {
                    NextAction::Continue
                }
            }
        }
    }

    /// Opens a new session, or resumes the one named in the request.
    fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeAck, DaemonError> {
        if self.state.is_shutting_down() {
            return Err(DaemonError::ShuttingDown);
        }
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(DaemonError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                got: request.protocol_version,
            });
        }
        let client_id = request.client_id.trim();
        if client_id.is_empty() {
            return Err(DaemonError::InvalidRequest(
                "client_id must not be empty".to_string(),
            ));
        }

        let sessions = &self.state.sessions;
        if let Some(resume) = request.resume_session {
            let id = SessionId::from_str(&resume)
                .map_err(|_| DaemonError::SessionNotFound(resume.clone()))?;
            let snapshot = sessions.resume(&id, self.id, client_id)?;
            return Ok(HandshakeAck {
                session_id: id.to_string(),
                protocol_version: PROTOCOL_VERSION,
                capabilities: snapshot.capabilities.names(),
                ttl_secs: snapshot.ttl.as_secs(),
                resumed: true,
            });
        }

        let capabilities =
            Capabilities::from_names(&request.capabilities) & Capabilities::supported();
        let ttl = request.ttl_secs.map(Duration::from_secs);
        let id = sessions.create_session(
            self.id,
            ttl,
            ClientIdentity::new(client_id, capabilities),
        )?;
        Ok(HandshakeAck {
            session_id: id.to_string(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: capabilities.names(),
            ttl_secs: sessions.effective_ttl(ttl).as_secs(),
            resumed: false,
        })
    }

    fn process_request(&mut self, request: RequestFrame, raw: &str) {
        // A retransmitted request is answered by the response to the original.
        match self.state.connections.record_inbound(self.id, raw.as_bytes()) {
            Ok(true) => {
                debug!(connection = %self.id, request = %request.id, "Duplicate request suppressed.");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                debug!(connection = %self.id, "Dropping request on closed connection: {}", e);
                return;
            }
        }

        let Ok(permit) = Arc::clone(&self.in_flight).try_acquire_owned() else {
            let limit = self.state.config.connection.max_in_flight_requests;
            self.record(MetricType::InFlightLimitRejected, 1.0);
            let error = DaemonError::LimitExceeded {
                scope: LimitScope::InFlight,
                limit,
            };
            self.send(&ServerFrame::Response(ResponseFrame::failure(
                request.id, &error,
            )));
            return;
        };

        let inbound = InboundRequest {
            connection_id: self.id,
            id: request.id,
            method: request.method,
            params: request.params,
            size_bytes: raw.len() as u64,
        };
        let progress: Arc<dyn ProgressReporter> = Arc::new(ConnectionProgress {
            connections: Arc::clone(&self.state.connections),
            connection_id: self.id,
            request_id: inbound.id.clone(),
        });
        let state = Arc::clone(&self.state);
        let connection_id = self.id;
        let session_id = request.session_id;

        self.requests.spawn(async move {
            let _permit = permit;
            let response = state.router.dispatch(&session_id, inbound, progress).await;
            send_frame(
                &state.connections,
                connection_id,
                &ServerFrame::Response(response),
            );
        });
    }

    /// Closes a session bound to this connection. Sessions owned by other
    /// connections are reported as not found.
    fn process_close_session(&self, session_id: &str) {
        let result = SessionId::from_str(session_id)
            .map_err(|_| DaemonError::SessionNotFound(session_id.to_string()))
            .and_then(|id| {
                self.state.sessions.get_for_connection(&id, self.id)?;
                Ok(id)
            });
        match result {
            Ok(id) => {
                self.state.sessions.close(&id, CloseReason::Explicit);
                self.send(&ServerFrame::Event(EventFrame {
                    event: "session_closed".to_string(),
                    request_id: None,
                    payload: json!({ "session_id": id.to_string() }),
                }));
            }
            Err(e) => self.send(&ServerFrame::error(&e)),
        }
    }

    fn reject_frame(&self, error: DaemonError) {
        self.state.stats.increment_malformed_frames();
        debug!(connection = %self.id, "Rejected frame: {}", error);
        self.send(&ServerFrame::error(&error));
    }

    fn send(&self, frame: &ServerFrame) {
        send_frame(&self.state.connections, self.id, frame);
    }

    fn record(&self, metric_type: MetricType, value: f64) {
        self.state.metrics.record(MetricSample::new(
            metric_type,
            value,
            Origin::Connection(self.id),
        ));
    }
}

/// Encodes and queues a frame. A connection that is already gone is not an
/// error here; the frame simply has nowhere to go.
fn send_frame(connections: &ConnectionManager, id: ConnectionId, frame: &ServerFrame) {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(connection = %id, "Failed to encode frame: {}", e);
            return;
        }
    };
    if let Err(e) = connections.send(id, text) {
        debug!(connection = %id, "Frame not sent: {}", e);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Delivers handler progress as `progress` event frames.
struct ConnectionProgress {
    connections: Arc<ConnectionManager>,
    connection_id: ConnectionId,
    request_id: String,
}

impl ProgressReporter for ConnectionProgress {
    fn report(&self, payload: Value) {
        send_frame(
            &self.connections,
            self.connection_id,
            &ServerFrame::Event(EventFrame {
                event: "progress".to_string(),
                request_id: Some(self.request_id.clone()),
                payload,
            }),
        );
    }
}
