// tests/integration/test_helpers.rs

//! Test helpers for integration tests: a daemon bound to ephemeral ports and a
//! minimal WebSocket client speaking the frame protocol.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tidegate::config::Config;
use tidegate::core::router::{HandlerRegistry, register_builtin};
use tidegate::core::state::ShutdownSummary;
use tidegate::core::telemetry::{AsyncLogDelivery, LogSink, MetricsCollector};
use tidegate::server::{self, ServerHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// How long a test waits for any single frame before failing.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Keeps delivered log lines in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    pub lines: Arc<Mutex<Vec<String>>>,
}

impl LogSink for MemorySink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A running daemon on ephemeral ports.
pub struct TestDaemon {
    pub handle: ServerHandle,
    pub log_sink: MemorySink,
}

impl TestDaemon {
    /// Starts a daemon with the default configuration and built-in handlers.
    pub async fn start() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let mut handlers = HandlerRegistry::new();
        register_builtin(&mut handlers);
        Self::with_handlers(config, handlers).await
    }

    pub async fn with_handlers(config: Config, handlers: HandlerRegistry) -> Self {
        init_tracing();

        let log_sink = MemorySink::default();
        let metrics = Arc::new(MetricsCollector::new(&config.metrics));
        let logs = Arc::new(AsyncLogDelivery::new(
            &config.log,
            Box::new(log_sink.clone()),
            Some(Arc::clone(&metrics)),
        ));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind WebSocket listener");
        let metrics_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind metrics listener");

        let ctx = server::setup_with_listeners(
            config,
            metrics,
            logs,
            handlers,
            listener,
            Some(metrics_listener),
        )
        .expect("Failed to set up daemon");
        let handle = server::spawn(ctx).expect("Failed to spawn daemon");
        Self { handle, log_sink }
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        self.handle
            .metrics_addr
            .expect("metrics listener was bound")
    }

    /// Opens a WebSocket connection to the daemon.
    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.addr()).await
    }

    pub async fn shutdown(self) -> ShutdownSummary {
        self.handle.shutdown().await.expect("shutdown failed")
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A WebSocket client exchanging JSON frames with the daemon.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_request: u64,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("WebSocket handshake failed");
        Self {
            ws,
            next_request: 0,
        }
    }

    pub async fn send_json(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .expect("Failed to send frame");
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("Failed to send frame");
    }

    /// Returns the next JSON frame, or `None` if the daemon closed the
    /// connection.
    pub async fn try_recv_json(&mut self) -> Option<Value> {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("Timed out waiting for a frame");
            match message {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(text.as_str()).expect("frame is JSON"));
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn recv_json(&mut self) -> Value {
        self.try_recv_json()
            .await
            .expect("Connection closed while waiting for a frame")
    }

    /// Opens a session and returns the handshake ack.
    pub async fn handshake(&mut self, client_id: &str, capabilities: &[&str]) -> Value {
        self.send_json(json!({
            "type": "handshake",
            "protocol_version": 1,
            "client_id": client_id,
            "capabilities": capabilities,
            "ttl_secs": 60,
        }))
        .await;
        let ack = self.recv_json().await;
        assert_eq!(ack["type"], "handshake_ack", "unexpected frame: {ack}");
        ack
    }

    /// Sends a request and waits for its response, skipping event frames.
    pub async fn request(&mut self, session_id: &str, method: &str, params: Value) -> Value {
        self.next_request += 1;
        let id = format!("req-{}", self.next_request);
        self.send_json(json!({
            "type": "request",
            "id": id,
            "session_id": session_id,
            "method": method,
            "params": params,
        }))
        .await;
        loop {
            let frame = self.recv_json().await;
            if frame["type"] == "response" && frame["id"] == id {
                return frame;
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Wait for the daemon's close reply so the handler has observed it.
        while let Ok(Some(Ok(_))) = tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await {}
    }
}

/// Polls `condition` until it holds, failing the test after `RECV_TIMEOUT`.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Issues a plain HTTP GET and returns the status line and body.
pub async fn http_get(addr: SocketAddr, path: &str) -> (String, String) {
    let mut stream = TcpStream::connect(addr)
        .await
        .expect("Failed to connect to metrics server");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Failed to send request");
    let mut response = Vec::new();
    tokio::time::timeout(RECV_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("Timed out reading response")
        .expect("Failed to read response");

    let response = String::from_utf8(response).expect("response is UTF-8");
    let (head, body) = response
        .split_once("\r\n\r\n")
        .expect("response has a header block");
    let status = head.lines().next().unwrap_or_default().to_string();
    (status, body.to_string())
}
