// tests/integration/observability_test.rs

//! Tests for the metrics server: Prometheus text on `/metrics` and the JSON
//! daemon snapshot on `/snapshot`.

use super::test_helpers::{RECV_TIMEOUT, TestDaemon, http_get};
use serde_json::Value;
use std::time::Duration;
use tidegate::config::{Config, SamplerConfig};

fn unsampled_config() -> Config {
    let mut config = Config::default();
    config.metrics.flush_interval = Duration::from_millis(50);
    config.metrics.sampler = SamplerConfig {
        base_rate: 1.0,
        min_rate: 1.0,
        max_rate: 1.0,
        ..SamplerConfig::default()
    };
    config
}

#[tokio::test]
async fn test_metrics_endpoint_exports_gauges_and_flushed_events() {
    let daemon = TestDaemon::with_config(unsampled_config()).await;
    let mut client = daemon.connect().await;
    let ack = client.handshake("cli-metrics", &[]).await;
    let sid = ack["session_id"].as_str().unwrap().to_string();
    let response = client.request(&sid, "ping", Value::Null).await;
    assert_eq!(response["ok"], true);

    let (status, body) = http_get(daemon.metrics_addr(), "/metrics").await;
    assert!(status.contains("200"), "status was {status}");
    assert!(body.contains("tidegate_connections_open 1"), "body was:\n{body}");
    assert!(body.contains("tidegate_sessions_active 1"));
    assert!(body.contains("tidegate_metrics_sample_rate 1"));

    // Events reach Prometheus once the flusher has run.
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let (_, body) = http_get(daemon.metrics_addr(), "/metrics").await;
        if body.contains("tidegate_events_total{type=\"request_completed\"}") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "request_completed never exported:\n{body}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    client.close().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_endpoint_describes_the_daemon() {
    let daemon = TestDaemon::with_config(unsampled_config()).await;
    let mut client = daemon.connect().await;
    let ack = client.handshake("cli-snapshot", &[]).await;
    let sid = ack["session_id"].as_str().unwrap().to_string();
    client.request(&sid, "no.such.method", Value::Null).await;

    let (status, body) = http_get(daemon.metrics_addr(), "/snapshot").await;
    assert!(status.contains("200"), "status was {status}");
    let snapshot: Value = serde_json::from_str(&body).expect("snapshot is JSON");

    assert_eq!(snapshot["version"], tidegate::VERSION);
    assert_eq!(snapshot["shutting_down"], false);
    assert_eq!(snapshot["connections"]["open"], 1);
    assert_eq!(snapshot["sessions"]["live"], 1);
    assert_eq!(snapshot["sessions"]["created_total"], 1);
    assert_eq!(snapshot["transport"]["handshakes"], 1);
    assert_eq!(snapshot["in_flight_requests"], 0);
    assert_eq!(snapshot["metrics"]["sample_rate"], 1.0);
    assert!(snapshot["breakers"].is_array());
    assert!(snapshot["logs"]["capacity"].as_u64().unwrap() > 0);

    client.close().await;
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let daemon = TestDaemon::start().await;
    let (status, _) = http_get(daemon.metrics_addr(), "/nope").await;
    assert!(status.contains("404"), "status was {status}");
    daemon.shutdown().await;
}
