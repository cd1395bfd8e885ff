// tests/integration/websocket_test.rs

//! End-to-end tests of the frame protocol over a real WebSocket.

use super::test_helpers::{TestClient, TestDaemon, wait_until};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tidegate::DaemonError;
use tidegate::config::Config;
use tidegate::core::SessionId;
use tidegate::core::router::{
    Deadline, Handler, HandlerRegistry, HandlerRequest, ProgressReporter, register_builtin,
};
use tidegate::core::session::SessionSnapshot;

fn session_id(ack: &Value) -> String {
    ack["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_handshake_and_ping_update_the_session() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    let ack = client.handshake("cli-1", &["progress", "teleport"]).await;
    assert_eq!(ack["protocol_version"], 1);
    assert_eq!(ack["capabilities"], json!(["progress"]));
    assert_eq!(ack["ttl_secs"], 60);
    assert_eq!(ack["resumed"], false);
    let sid = session_id(&ack);

    let response = client.request(&sid, "ping", Value::Null).await;
    assert_eq!(response["ok"], true, "unexpected response: {response}");
    assert_eq!(response["result"]["pong"], true);

    let snapshot = daemon
        .handle
        .state
        .sessions
        .get(&SessionId::from_str(&sid).unwrap())
        .unwrap();
    assert_eq!(snapshot.client_id, "cli-1");
    assert_eq!(snapshot.metrics.requests_handled, 1);
    assert!(snapshot.metrics.bytes_received > 0);
    assert!(snapshot.idle < Duration::from_secs(5));

    let info = client.request(&sid, "session.info", Value::Null).await;
    assert_eq!(info["result"]["client_id"], "cli-1");
    assert_eq!(info["result"]["requests_handled"], 1);

    client.close().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_echo_sends_progress_before_the_response() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;
    let sid = session_id(&client.handshake("cli-echo", &["progress"]).await);

    client
        .send_json(json!({
            "type": "request",
            "id": "e-1",
            "session_id": sid,
            "method": "echo",
            "params": { "x": 1 },
        }))
        .await;

    let event = client.recv_json().await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "progress");
    assert_eq!(event["request_id"], "e-1");

    let response = client.recv_json().await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["result"], json!({ "x": 1 }));

    client.close().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_protocol_mismatch_closes_the_connection() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    client
        .send_json(json!({
            "type": "handshake",
            "protocol_version": 99,
            "client_id": "old-client",
        }))
        .await;
    let frame = client.recv_json().await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["error"]["code"], "PROTOCOL_MISMATCH");
    assert_eq!(frame["error"]["retryable"], false);
    assert!(client.try_recv_json().await.is_none());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_are_rejected_without_closing() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;

    client.send_raw("this is not json").await;
    let frame = client.recv_json().await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["error"]["code"], "INVALID_REQUEST");

    // The connection is still usable.
    client.handshake("cli-2", &[]).await;
    assert_eq!(daemon.handle.state.stats.snapshot().malformed_frames, 1);

    client.close().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_unknown_method_and_unknown_session() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;
    let sid = session_id(&client.handshake("cli-3", &[]).await);

    let response = client.request(&sid, "no.such.method", Value::Null).await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "UNKNOWN_METHOD");

    let response = client
        .request(&SessionId::new().to_string(), "ping", Value::Null)
        .await;
    assert_eq!(response["error"]["code"], "SESSION_NOT_FOUND");

    client.close().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_retransmitted_request_is_answered_once() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;
    let sid = session_id(&client.handshake("cli-dup", &[]).await);

    let frame = json!({
        "type": "request",
        "id": "dup-1",
        "session_id": sid,
        "method": "ping",
    });
    client.send_json(frame.clone()).await;
    client.send_json(frame).await;
    client
        .send_json(json!({
            "type": "request",
            "id": "after",
            "session_id": sid,
            "method": "ping",
        }))
        .await;

    let mut ids = vec![
        client.recv_json().await["id"].as_str().unwrap().to_string(),
        client.recv_json().await["id"].as_str().unwrap().to_string(),
    ];
    ids.sort();
    assert_eq!(ids, vec!["after".to_string(), "dup-1".to_string()]);

    let snapshot = daemon
        .handle
        .state
        .sessions
        .get(&SessionId::from_str(&sid).unwrap())
        .unwrap();
    assert_eq!(snapshot.metrics.requests_handled, 2);

    client.close().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_session_resumes_on_a_new_connection() {
    let daemon = TestDaemon::start().await;
    let mut first = daemon.connect().await;
    let sid = session_id(&first.handshake("cli-resume", &["resume"]).await);
    first.close().await;

    let state = Arc::clone(&daemon.handle.state);
    wait_until(|| state.connections.is_empty()).await;
    assert_eq!(state.sessions.len(), 1);

    // Another client cannot take the session over.
    let mut intruder = daemon.connect().await;
    intruder
        .send_json(json!({
            "type": "handshake",
            "protocol_version": 1,
            "client_id": "someone-else",
            "resume_session": sid,
        }))
        .await;
    let frame = intruder.recv_json().await;
    assert_eq!(frame["error"]["code"], "SESSION_NOT_FOUND");
    intruder.close().await;

    let mut second = daemon.connect().await;
    second
        .send_json(json!({
            "type": "handshake",
            "protocol_version": 1,
            "client_id": "cli-resume",
            "resume_session": sid,
        }))
        .await;
    let ack = second.recv_json().await;
    assert_eq!(ack["type"], "handshake_ack");
    assert_eq!(ack["resumed"], true);
    assert_eq!(ack["session_id"], sid.as_str());
    assert_eq!(ack["capabilities"], json!(["resume"]));

    let response = second.request(&sid, "ping", Value::Null).await;
    assert_eq!(response["ok"], true);
    assert_eq!(state.sessions.stats().resumed_total, 1);

    second.close().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_close_session_emits_an_event() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.connect().await;
    let sid = session_id(&client.handshake("cli-close", &[]).await);

    client
        .send_json(json!({ "type": "close_session", "session_id": sid }))
        .await;
    let event = client.recv_json().await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "session_closed");
    assert_eq!(event["payload"]["session_id"], sid.as_str());
    assert!(daemon.handle.state.sessions.is_empty());

    let response = client.request(&sid, "ping", Value::Null).await;
    assert_eq!(response["error"]["code"], "SESSION_NOT_FOUND");

    client.close().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_missing_handshake_times_out() {
    let mut config = Config::default();
    config.connection.handshake_timeout = Duration::from_millis(200);
    let daemon = TestDaemon::with_config(config).await;
    let mut client = daemon.connect().await;

    let frame = client.recv_json().await;
    assert_eq!(frame["error"]["code"], "TIMEOUT");
    assert!(client.try_recv_json().await.is_none());

    daemon.shutdown().await;
}

/// Sleeps for a fixed time unless cancelled.
struct SlowHandler(Duration);

#[async_trait]
impl Handler for SlowHandler {
    async fn handle(
        &self,
        _request: HandlerRequest,
        _session: SessionSnapshot,
        deadline: Deadline,
        _progress: Arc<dyn ProgressReporter>,
    ) -> Result<Value, DaemonError> {
        tokio::select! {
            _ = tokio::time::sleep(self.0) => Ok(json!("done")),
            _ = deadline.cancelled() => Err(DaemonError::Cancelled),
        }
    }
}

#[tokio::test]
async fn test_in_flight_limit_rejects_excess_requests() {
    let mut config = Config::default();
    config.connection.max_in_flight_requests = 1;
    let mut handlers = HandlerRegistry::new();
    register_builtin(&mut handlers);
    handlers.register("slow", Arc::new(SlowHandler(Duration::from_millis(300))));
    let daemon = TestDaemon::with_handlers(config, handlers).await;

    let mut client: TestClient = daemon.connect().await;
    let sid = session_id(&client.handshake("cli-busy", &[]).await);
    for id in ["slow-1", "slow-2"] {
        client
            .send_json(json!({
                "type": "request",
                "id": id,
                "session_id": sid,
                "method": "slow",
            }))
            .await;
    }

    let rejected = client.recv_json().await;
    assert_eq!(rejected["id"], "slow-2");
    assert_eq!(rejected["error"]["code"], "LIMIT_EXCEEDED");

    let completed = client.recv_json().await;
    assert_eq!(completed["id"], "slow-1");
    assert_eq!(completed["result"], "done");

    client.close().await;
    daemon.shutdown().await;
}
