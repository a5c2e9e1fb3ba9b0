//! Execution manager integration tests.
//!
//! These tests verify session identity, the concurrency limit, the session
//! timeout and the kill/cleanup rules as seen from outside the crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};

use conductor::core::{ExecutionCallbacks, ExecutionParams, ExecutionStatus};
use conductor::orchestration::mock::MockBehavior;
use conductor::Error;

use crate::fixtures::Harness;

fn params(query: &str) -> ExecutionParams {
    ExecutionParams::new("/tmp/project", query).with_agent("backend")
}

/// Test: Concurrency limit under simultaneous starts
/// Given max_concurrent = 2 and five simultaneous starts
/// When the workers all hang
/// Then exactly two run and the rest fail with CapacityExceeded
#[tokio::test(start_paused = true)]
async fn test_simultaneous_starts_respect_limit() {
    let harness = Harness::with_limits(MockBehavior::Hang, 2, 5);

    let starts = (0..5).map(|i| {
        let manager = harness.manager.clone();
        async move {
            manager
                .start(params(&format!("query {}", i)), ExecutionCallbacks::new())
                .await
        }
    });
    let results = join_all(starts).await;

    let started = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(Error::CapacityExceeded { max: 2 })))
        .count();
    assert_eq!(started, 2);
    assert_eq!(rejected, 3);
    assert_eq!(harness.manager.list_active().await.len(), 2);

    assert_eq!(harness.manager.kill_all().await, 2);
    assert!(harness.manager.list_active().await.is_empty());
}

/// Test: Session resolution timeout
/// Given a worker that never announces a session
/// When the session timeout elapses
/// Then start fails and nothing is left active
#[tokio::test(start_paused = true)]
async fn test_silent_worker_times_out_and_is_not_active() {
    let harness = Harness::new(MockBehavior::Silent);

    let result = harness
        .manager
        .start(params("hello"), ExecutionCallbacks::new())
        .await;

    assert!(matches!(result, Err(Error::SessionResolutionTimeout(_))));
    assert!(harness.manager.list_active().await.is_empty());
    assert_eq!(harness.manager.active_count().await, 0);
    assert_eq!(harness.spawner.spawn_count(), 1);
}

/// Test: Resume resolves without the timeout race
/// Given a silent worker, which would time out a new session
/// When an explicit session id is resumed
/// Then start returns that id straight away
#[tokio::test(start_paused = true)]
async fn test_resume_returns_known_session_immediately() {
    let harness = Harness::new(MockBehavior::Silent);
    let started = tokio::time::Instant::now();

    let session_id = assert_ok!(
        harness
            .manager
            .start(params("continue").resume("sess-42"), ExecutionCallbacks::new())
            .await
    );

    assert_eq!(session_id, "sess-42");
    assert!(started.elapsed() < Duration::from_secs(1));
    let execution = harness.manager.get("sess-42").await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(harness.spawner.spawned()[0].session_id.as_deref(), Some("sess-42"));

    // Resuming a session that is still running is refused.
    assert!(matches!(
        harness
            .manager
            .start(params("again").resume("sess-42"), ExecutionCallbacks::new())
            .await,
        Err(Error::SessionExists(_))
    ));
    harness.manager.kill_all().await;
}

/// Test: Kill is idempotent
/// Given a running execution
/// When it is killed twice
/// Then it ends killed and the second kill is a no-op
#[tokio::test(start_paused = true)]
async fn test_kill_twice_is_noop() {
    let harness = Harness::new(MockBehavior::Hang);
    let session_id = harness
        .manager
        .start(params("work"), ExecutionCallbacks::new())
        .await
        .unwrap();

    assert_ok!(harness.manager.kill(&session_id).await);
    assert_ok!(harness.manager.kill(&session_id).await);

    let execution = harness.manager.get(&session_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Killed);
    assert!(execution.end_time.is_some());
    assert!(!harness.manager.is_alive(&session_id).await);
    assert_err!(harness.manager.kill("no-such-session").await);
}

/// Test: Cleanup refuses active executions
/// Given a running execution
/// When cleanup is requested before and after it is killed
/// Then the first attempt fails and keeps the record, the second removes it
#[tokio::test(start_paused = true)]
async fn test_cleanup_rejects_active_execution() {
    let harness = Harness::new(MockBehavior::Hang);
    let session_id = harness
        .manager
        .start(params("work"), ExecutionCallbacks::new())
        .await
        .unwrap();

    assert!(matches!(
        harness.manager.cleanup(&session_id).await,
        Err(Error::ExecutionStillActive(_))
    ));
    assert!(harness.manager.get(&session_id).await.is_some());

    harness.manager.kill(&session_id).await.unwrap();
    assert_ok!(harness.manager.cleanup(&session_id).await);
    assert!(harness.manager.get(&session_id).await.is_none());
}

/// Test: Callbacks see the whole execution
/// Given a worker that completes successfully
/// When it is started with stream and completion callbacks
/// Then the init event is delivered and completion fires once with Completed
#[tokio::test(start_paused = true)]
async fn test_callbacks_observe_completion() {
    let harness = Harness::new(MockBehavior::success());
    let streamed = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(Mutex::new(Vec::new()));

    let stream_sink = Arc::clone(&streamed);
    let complete_sink = Arc::clone(&completed);
    let callbacks = ExecutionCallbacks::new()
        .on_stream(move |_, event| {
            stream_sink
                .lock()
                .unwrap()
                .push(event.event_type().unwrap_or_default().to_string())
        })
        .on_complete(move |session_id, status| {
            complete_sink
                .lock()
                .unwrap()
                .push((session_id.to_string(), status))
        });

    let session_id = harness.manager.start(params("work"), callbacks).await.unwrap();
    let execution = harness.manager.wait_for_terminal(&session_id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.exit_code, Some(0));
    assert!(execution.result().map(|r| r.is_success()).unwrap_or(false));
    assert_eq!(streamed.lock().unwrap().first().map(String::as_str), Some("system"));
    assert_eq!(
        *completed.lock().unwrap(),
        vec![(session_id.clone(), ExecutionStatus::Completed)]
    );

    let stats = harness.manager.stats().await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.active(), 0);
}
