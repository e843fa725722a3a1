//! End-to-end integration tests for termhub.
//!
//! These tests verify complete flows work correctly:
//! - Session lifecycle against real programs
//! - Capacity and command admission limits
//! - Termination deadlines
//! - Control socket round trips through the orchestrator

use std::sync::Arc;
use std::time::{Duration, Instant};

use termhub::config::Config;
use termhub::ipc::IpcClient;
use termhub::orchestrator::{DaemonOrchestrator, OrchestratorState};
use termhub::protocol::{ErrorKind, ExitInfo, ProcessStateInfo};
use termhub::session::{
    ExitStatus, ManagerOptions, ProcessState, QueueLimits, SessionError, SessionManager,
    SessionManagerImpl, SessionOptions, SessionSpec, SessionState, TerminalSize,
};
use termhub::IpcError;
use tempfile::TempDir;

fn fast_options() -> SessionOptions {
    SessionOptions {
        debounce: Duration::from_millis(50),
        launch_timeout: Duration::from_millis(100),
        grace_period: Duration::from_millis(500),
        kill_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        ..SessionOptions::default()
    }
}

fn manager(max_sessions: usize, session: SessionOptions) -> Arc<SessionManagerImpl> {
    Arc::new(SessionManagerImpl::with_options(ManagerOptions {
        max_sessions,
        session,
        ..ManagerOptions::default()
    }))
}

/// Polls retained output until it contains `needle`.
async fn wait_for_output(manager: &SessionManagerImpl, id: &String, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (bytes, _) = manager.drain_output(id, 0).unwrap();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if text.contains(needle) {
            return text;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {needle:?}, got {text:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn create_test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.daemon.socket_path = Some(temp_dir.path().join("daemon.sock"));
    config.session.default_command = vec!["/bin/cat".to_string()];
    config.session.max_sessions = 2;
    config.session.grace_period_ms = 300;
    config.session.debounce_ms = 50;
    config.session.launch_timeout_ms = 100;
    config.session.poll_interval_ms = 10;
    config
}

// =============================================================================
// Session Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_cat_echoes_and_terminates_gracefully() {
    let manager = manager(4, fast_options());
    let id = manager.create(SessionSpec::new(["/bin/cat"])).await.unwrap();

    manager.write(&id, b"hello\n").await.unwrap();
    let text = wait_for_output(&manager, &id, "hello").await;
    assert!(text.contains("hello"));

    let state = manager.terminate(&id, false).await.unwrap();
    match state {
        ProcessState::Exited(ExitStatus::Code(0))
        | ProcessState::Exited(ExitStatus::Signaled(_)) => {}
        other => panic!("unexpected final state: {other:?}"),
    }
    assert!(!manager.exists(&id));
}

#[tokio::test]
async fn test_cursor_resumes_where_previous_drain_ended() {
    let manager = manager(4, fast_options());
    let id = manager.create(SessionSpec::new(["/bin/cat"])).await.unwrap();

    manager.write(&id, b"first\n").await.unwrap();
    wait_for_output(&manager, &id, "first").await;
    let (_, cursor) = manager.drain_output(&id, 0).unwrap();

    manager.write(&id, b"second\n").await.unwrap();
    wait_for_output(&manager, &id, "second").await;
    let (bytes, next) = manager.drain_output(&id, cursor).unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("second"));
    assert!(!text.contains("first"));
    assert!(next > cursor);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_capacity_rejects_one_past_limit() {
    let manager = manager(3, fast_options());
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(manager.create(SessionSpec::new(["/bin/cat"])).await.unwrap());
    }

    let err = manager.create(SessionSpec::new(["/bin/cat"])).await.unwrap_err();
    assert!(matches!(err, SessionError::CapacityExceeded { max: 3 }));
    assert_eq!(manager.count(), 3);

    manager.terminate(&ids[0], true).await.unwrap();
    assert!(manager.create(SessionSpec::new(["/bin/cat"])).await.is_ok());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_submits_admit_exactly_one() {
    let options = SessionOptions {
        debounce: Duration::from_secs(5),
        limits: QueueLimits {
            max_in_flight: 1,
            queue_commands: false,
            max_queued: 0,
        },
        ..fast_options()
    };
    let manager = manager(4, options);
    let id = manager.create(SessionSpec::new(["/bin/cat"])).await.unwrap();
    manager
        .get(&id)
        .unwrap()
        .wait_for_state(|s| s == SessionState::Idle, Duration::from_secs(2))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            manager.submit(&id, format!("line {i}")).await
        }));
    }

    let mut admitted = 0;
    let mut busy = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(SessionError::Busy { .. }) => busy += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(busy, 7);

    let info = manager.info(&id).await.unwrap();
    assert_eq!(info.in_flight, 1);
    assert_eq!(info.queued, 0);
    assert_eq!(info.state, SessionState::Busy);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_term_ignoring_session_is_killed_after_grace() {
    let options = fast_options();
    let bound = options.grace_period + options.kill_timeout + Duration::from_secs(1);
    let manager = manager(4, options);
    let id = manager
        .create(SessionSpec::new([
            "/bin/sh",
            "-c",
            "trap '' TERM HUP; while :; do sleep 0.1; done",
        ]))
        .await
        .unwrap();
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let state = manager.terminate(&id, false).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < bound, "termination took {elapsed:?}");
    assert!(matches!(state, ProcessState::Exited(_)), "{state:?}");
    assert!(!manager.exists(&id));
}

#[tokio::test]
async fn test_resize_is_visible_to_child() {
    let manager = manager(4, fast_options());
    let id = manager.create(SessionSpec::new(["/bin/sh"])).await.unwrap();

    let size = TerminalSize::new(40, 120).unwrap();
    manager.resize(&id, size).await.unwrap();
    assert_eq!(manager.info(&id).await.unwrap().size, size);

    manager.write(&id, b"stty size\n").await.unwrap();
    wait_for_output(&manager, &id, "40 120").await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exit_outside_termination_is_error() {
    let manager = manager(4, fast_options());
    let id = manager
        .create(SessionSpec::new(["/bin/sh", "-c", "echo bye"]))
        .await
        .unwrap();
    let session = manager.get(&id).unwrap();

    let state = session
        .wait_for_state(SessionState::is_terminal, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(state, SessionState::Error);

    let err = manager.write(&id, b"ignored\n").await.unwrap_err();
    assert!(matches!(err, SessionError::NotRunning { .. }));

    // Output is still readable after the exit.
    wait_for_output(&manager, &id, "bye").await;

    let state = manager.terminate(&id, false).await.unwrap();
    assert_eq!(state, ProcessState::Exited(ExitStatus::Code(0)));
}

// =============================================================================
// Control Socket Tests
// =============================================================================

#[tokio::test]
async fn test_ipc_round_trip_through_orchestrator() {
    let temp_dir = TempDir::new().unwrap();
    let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);

    let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
    assert!(client.ping().await.unwrap());

    let session_id = client.create_session(Vec::new()).await.unwrap();
    let listed = client.list_sessions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].argv, vec!["/bin/cat".to_string()]);

    client.write(&session_id, b"over the wire\n").await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut output = Vec::new();
    let mut cursor = 0;
    while !String::from_utf8_lossy(&output).contains("over the wire") {
        assert!(Instant::now() < deadline, "no output over IPC");
        let (data, next) = client.drain(&session_id, cursor, None).await.unwrap();
        output.extend_from_slice(&data);
        cursor = next;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.resize(&session_id, 30, 100).await.unwrap();
    let summary = client.get_session(&session_id).await.unwrap();
    assert_eq!((summary.rows, summary.cols), (30, 100));

    let process = client.terminate(&session_id, false).await.unwrap();
    assert!(matches!(
        process,
        ProcessStateInfo::Exited {
            exit: ExitInfo::Code(0) | ExitInfo::Signaled(_)
        }
    ));

    match client.get_session(&session_id).await {
        Err(IpcError::Remote { kind, .. }) => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("expected NotFound, got {other:?}"),
    }

    orchestrator.stop().await.unwrap();
    assert!(!orchestrator.socket_path().exists());
}

#[tokio::test]
async fn test_ipc_capacity_error_kind() {
    let temp_dir = TempDir::new().unwrap();
    let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
    orchestrator.start().await.unwrap();

    let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
    client.create_session(Vec::new()).await.unwrap();
    client.create_session(Vec::new()).await.unwrap();

    match client.create_session(Vec::new()).await {
        Err(IpcError::Remote { kind, .. }) => assert_eq!(kind, ErrorKind::CapacityExceeded),
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.session_manager().count(), 0);
}
