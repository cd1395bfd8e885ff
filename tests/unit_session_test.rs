// tests/unit_session_test.rs

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tidegate::config::{Config, SessionConfig};
use tidegate::core::errors::LimitScope;
use tidegate::core::protocol::Capabilities;
use tidegate::core::session::{
    ClientIdentity, CloseReason, LivenessProbe, SessionManager, SessionObserver, SessionSnapshot,
};
use tidegate::core::{ConnectionId, DaemonError, SessionId};
use tokio::time::Instant;

fn session_config() -> SessionConfig {
    let mut config = Config::default().session;
    config.default_ttl = Duration::from_secs(60);
    config.min_ttl = Duration::from_secs(1);
    config.max_ttl = Duration::from_secs(3600);
    config.max_sessions = 100;
    config.max_sessions_per_connection = 4;
    config.shards = 4;
    config.close_on_disconnect = false;
    config
}

fn identity(client: &str) -> ClientIdentity {
    ClientIdentity::new(client, Capabilities::PROGRESS)
}

/// A liveness probe whose answers the test controls.
#[derive(Default)]
struct FakeLiveness {
    activity: Mutex<HashMap<ConnectionId, Instant>>,
}

impl FakeLiveness {
    fn mark(&self, id: ConnectionId) {
        self.activity.lock().insert(id, Instant::now());
    }
    fn disconnect(&self, id: ConnectionId) {
        self.activity.lock().remove(&id);
    }
}

impl LivenessProbe for FakeLiveness {
    fn last_activity(&self, connection_id: ConnectionId) -> Option<Instant> {
        self.activity.lock().get(&connection_id).copied()
    }
}

#[derive(Default)]
struct RecordingObserver {
    closed: Mutex<Vec<(SessionId, CloseReason)>>,
}

impl SessionObserver for RecordingObserver {
    fn on_session_closed(
        &self,
        session: &SessionSnapshot,
        reason: CloseReason,
    ) -> Result<(), DaemonError> {
        self.closed.lock().push((session.id, reason));
        Ok(())
    }
}

struct FailingObserver;

impl SessionObserver for FailingObserver {
    fn on_session_closed(&self, _: &SessionSnapshot, _: CloseReason) -> Result<(), DaemonError> {
        Err(DaemonError::Internal("observer exploded".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_and_get_session() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let conn = ConnectionId(1);
    let id = sessions
        .create_session(conn, Some(Duration::from_secs(60)), identity("client-a"))
        .unwrap();

    let snapshot = sessions.get(&id).unwrap();
    assert_eq!(snapshot.connection_id, Some(conn));
    assert_eq!(snapshot.client_id, "client-a");
    assert_eq!(snapshot.ttl, Duration::from_secs(60));
    assert_eq!(snapshot.metrics.requests_handled, 0);
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions.sessions_for(conn), 1);
}

#[tokio::test(start_paused = true)]
async fn test_requested_ttl_is_clamped() {
    let sessions = SessionManager::new(&session_config(), None, None);
    assert_eq!(sessions.effective_ttl(None), Duration::from_secs(60));
    assert_eq!(
        sessions.effective_ttl(Some(Duration::ZERO)),
        Duration::from_secs(1)
    );
    assert_eq!(
        sessions.effective_ttl(Some(Duration::from_secs(999_999))),
        Duration::from_secs(3600)
    );
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_expires_on_lookup() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let id = sessions
        .create_session(ConnectionId(1), Some(Duration::from_secs(60)), identity("c"))
        .unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    // Idle exactly equal to the TTL is still alive.
    assert!(sessions.get(&id).is_ok());

    tokio::time::advance(Duration::from_secs(65)).await;
    assert_eq!(
        sessions.get(&id),
        Err(DaemonError::SessionNotFound(id.to_string()))
    );
    assert_eq!(sessions.len(), 0);
    assert_eq!(sessions.stats().expired_total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_touch_extends_lifetime() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let id = sessions
        .create_session(ConnectionId(1), Some(Duration::from_secs(10)), identity("c"))
        .unwrap();

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(8)).await;
        sessions.touch(&id);
    }
    assert!(sessions.get(&id).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_record_request_updates_metrics_and_activity() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let id = sessions
        .create_session(ConnectionId(1), None, identity("c"))
        .unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    sessions.record_request(&id, true, 100, 40);
    sessions.record_request(&id, false, 10, 5);

    let snapshot = sessions.get(&id).unwrap();
    assert_eq!(snapshot.metrics.requests_handled, 2);
    assert_eq!(snapshot.metrics.errors, 1);
    assert_eq!(snapshot.metrics.bytes_received, 110);
    assert_eq!(snapshot.metrics.bytes_sent, 45);
    assert_eq!(snapshot.idle, Duration::ZERO);
    assert_eq!(snapshot.age, Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_per_connection_limit() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let conn = ConnectionId(7);
    for _ in 0..4 {
        sessions.create_session(conn, None, identity("c")).unwrap();
    }
    assert_eq!(
        sessions.create_session(conn, None, identity("c")),
        Err(DaemonError::LimitExceeded {
            scope: LimitScope::PerConnection,
            limit: 4,
        })
    );
    // Another connection is unaffected.
    assert!(sessions.create_session(ConnectionId(8), None, identity("c")).is_ok());
    assert_eq!(sessions.len(), 5);
    assert_eq!(sessions.stats().rejected_total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_global_limit_leaves_no_trace() {
    let mut config = session_config();
    config.max_sessions = 2;
    let sessions = SessionManager::new(&config, None, None);
    sessions.create_session(ConnectionId(1), None, identity("c")).unwrap();
    sessions.create_session(ConnectionId(2), None, identity("c")).unwrap();

    let rejected = sessions.create_session(ConnectionId(3), None, identity("c"));
    assert!(matches!(
        rejected,
        Err(DaemonError::LimitExceeded {
            scope: LimitScope::Global,
            ..
        })
    ));
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions.sessions_for(ConnectionId(3)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_removes_only_expired_sessions() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let observer = Arc::new(RecordingObserver::default());
    sessions.add_observer(observer.clone());

    let short = sessions
        .create_session(ConnectionId(1), Some(Duration::from_secs(5)), identity("c"))
        .unwrap();
    let long = sessions
        .create_session(ConnectionId(1), Some(Duration::from_secs(600)), identity("c"))
        .unwrap();

    tokio::time::advance(Duration::from_secs(10)).await;
    let report = sessions.sweep();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.expired, 1);
    assert_eq!(report.observer_errors, 0);

    assert!(sessions.get(&short).is_err());
    assert!(sessions.get(&long).is_ok());
    assert_eq!(*observer.closed.lock(), vec![(short, CloseReason::Expired)]);
    assert_eq!(sessions.sessions_for(ConnectionId(1)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_observer_does_not_stop_sweep() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let recorder = Arc::new(RecordingObserver::default());
    sessions.add_observer(Arc::new(FailingObserver));
    sessions.add_observer(recorder.clone());

    for conn in 0..3 {
        sessions
            .create_session(ConnectionId(conn), Some(Duration::from_secs(1)), identity("c"))
            .unwrap();
    }
    tokio::time::advance(Duration::from_secs(2)).await;

    let report = sessions.sweep();
    assert_eq!(report.expired, 3);
    assert_eq!(report.observer_errors, 3);
    assert_eq!(recorder.closed.lock().len(), 3);
    assert!(sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_expires_beside_an_active_sibling() {
    let liveness = Arc::new(FakeLiveness::default());
    let probe: Arc<dyn LivenessProbe> = liveness.clone();
    let sessions = SessionManager::new(&session_config(), Some(probe), None);
    let conn = ConnectionId(1);
    liveness.mark(conn);
    let busy = sessions
        .create_session(conn, Some(Duration::from_secs(60)), identity("c"))
        .unwrap();
    let idle = sessions
        .create_session(conn, Some(Duration::from_secs(60)), identity("c"))
        .unwrap();

    // The connection keeps carrying traffic, all of it for `busy`.
    for _ in 0..13 {
        tokio::time::advance(Duration::from_secs(5)).await;
        sessions.touch(&busy);
        liveness.mark(conn);
    }

    let report = sessions.sweep();
    assert_eq!(report.expired, 1);
    assert!(matches!(
        sessions.get(&idle),
        Err(DaemonError::SessionNotFound(_))
    ));
    assert!(sessions.get(&busy).is_ok());
    assert_eq!(sessions.sessions_for(conn), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_disconnect() {
    let liveness = Arc::new(FakeLiveness::default());
    let probe: Arc<dyn LivenessProbe> = liveness.clone();
    let sessions = SessionManager::new(&session_config(), Some(probe), None);
    let old_conn = ConnectionId(1);
    let new_conn = ConnectionId(2);
    liveness.mark(old_conn);
    let id = sessions
        .create_session(old_conn, None, identity("client-a"))
        .unwrap();

    // The old connection is still alive, so the session cannot move yet.
    assert!(sessions.resume(&id, new_conn, "client-a").is_err());

    liveness.disconnect(old_conn);
    assert_eq!(sessions.detach_connection(old_conn), 1);
    assert_eq!(sessions.get(&id).unwrap().connection_id, None);

    // Another client cannot take the session over.
    assert!(sessions.resume(&id, new_conn, "client-b").is_err());

    let resumed = sessions.resume(&id, new_conn, "client-a").unwrap();
    assert_eq!(resumed.connection_id, Some(new_conn));
    assert_eq!(sessions.sessions_for(new_conn), 1);
    assert_eq!(sessions.sessions_for(old_conn), 0);
    assert_eq!(sessions.stats().resumed_total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_detached_session_still_expires() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let id = sessions
        .create_session(ConnectionId(1), Some(Duration::from_secs(30)), identity("c"))
        .unwrap();
    sessions.detach_connection(ConnectionId(1));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(sessions.resume(&id, ConnectionId(2), "c").is_err());
    assert!(sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_on_disconnect_closes_sessions() {
    let mut config = session_config();
    config.close_on_disconnect = true;
    let sessions = SessionManager::new(&config, None, None);
    let observer = Arc::new(RecordingObserver::default());
    sessions.add_observer(observer.clone());

    let id = sessions.create_session(ConnectionId(1), None, identity("c")).unwrap();
    assert_eq!(sessions.detach_connection(ConnectionId(1)), 1);
    assert!(sessions.is_empty());
    assert_eq!(
        *observer.closed.lock(),
        vec![(id, CloseReason::Disconnected)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_explicit_close_and_close_all() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let a = sessions.create_session(ConnectionId(1), None, identity("c")).unwrap();
    sessions.create_session(ConnectionId(1), None, identity("c")).unwrap();
    sessions.create_session(ConnectionId(2), None, identity("c")).unwrap();

    assert!(sessions.close(&a, CloseReason::Explicit));
    assert!(!sessions.close(&a, CloseReason::Explicit));
    assert_eq!(sessions.len(), 2);

    assert_eq!(sessions.close_all(CloseReason::Shutdown), 2);
    assert!(sessions.is_empty());
    let stats = sessions.stats();
    assert_eq!(stats.closed_total, 3);
    assert_eq!(stats.bound_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn test_get_for_connection_checks_binding() {
    let sessions = SessionManager::new(&session_config(), None, None);
    let id = sessions.create_session(ConnectionId(1), None, identity("c")).unwrap();
    assert!(sessions.get_for_connection(&id, ConnectionId(1)).is_ok());
    assert!(sessions.get_for_connection(&id, ConnectionId(2)).is_err());
}
