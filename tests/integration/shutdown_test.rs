// tests/integration/shutdown_test.rs

use super::test_helpers::TestDaemon;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tidegate::DaemonError;
use tidegate::config::Config;
use tidegate::core::router::{
    Deadline, Handler, HandlerRegistry, HandlerRequest, ProgressReporter, register_builtin,
};
use tidegate::core::session::SessionSnapshot;

struct SleepyHandler;

#[async_trait]
impl Handler for SleepyHandler {
    async fn handle(
        &self,
        _request: HandlerRequest,
        _session: SessionSnapshot,
        deadline: Deadline,
        _progress: Arc<dyn ProgressReporter>,
    ) -> Result<Value, DaemonError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => Ok(json!("finished")),
            _ = deadline.cancelled() => Err(DaemonError::Cancelled),
        }
    }
}

#[tokio::test]
async fn test_shutdown_closes_connections_and_sessions() {
    let daemon = TestDaemon::start().await;
    let addr = daemon.addr();
    let mut first = daemon.connect().await;
    let mut second = daemon.connect().await;
    first.handshake("cli-a", &[]).await;
    second.handshake("cli-b", &[]).await;
    second.handshake("cli-b", &[]).await;

    let state = Arc::clone(&daemon.handle.state);
    let summary = daemon.shutdown().await;
    assert_eq!(summary.closed, 2);
    assert_eq!(summary.sessions_closed, 3);
    assert_eq!(summary.dropped, 0);
    assert!(state.is_shutting_down());
    assert!(state.sessions.is_empty());
    assert!(state.connections.is_empty());

    assert!(first.try_recv_json().await.is_none());
    assert!(second.try_recv_json().await.is_none());

    // The listener is gone.
    let url = format!("ws://{addr}/ws");
    assert!(tokio_tungstenite::connect_async(url).await.is_err());

    // A second shutdown reports the same summary.
    assert_eq!(state.shutdown().await, summary);
}

#[tokio::test]
async fn test_dispatched_request_finishes_during_shutdown() {
    let mut handlers = HandlerRegistry::new();
    register_builtin(&mut handlers);
    handlers.register("sleepy", Arc::new(SleepyHandler));
    let daemon = TestDaemon::with_handlers(Config::default(), handlers).await;

    let mut client = daemon.connect().await;
    let ack = client.handshake("cli-sleepy", &[]).await;
    client
        .send_json(json!({
            "type": "request",
            "id": "s-1",
            "session_id": ack["session_id"],
            "method": "sleepy",
        }))
        .await;
    let state = Arc::clone(&daemon.handle.state);
    super::test_helpers::wait_until(|| state.router.in_flight() == 1).await;

    let summary = daemon.shutdown().await;
    assert_eq!(summary.requests_cancelled, 0);

    let response = client.recv_json().await;
    assert_eq!(response["id"], "s-1");
    assert_eq!(response["result"], "finished");
    assert!(client.try_recv_json().await.is_none());
}
