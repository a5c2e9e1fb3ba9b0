//! Health tracker and recovery integration tests.
//!
//! These tests verify that the HealthTracker spots executions that stopped
//! sending events, lets them recover on a heartbeat, and cleans up the ones
//! that stay silent.

use std::time::Duration;

use tokio::sync::mpsc;

use conductor::core::{ExecutionCallbacks, ExecutionParams, ExecutionStatus};
use conductor::orchestration::mock::MockBehavior;
use conductor::orchestration::{
    HealthConfig, HealthEvent, HealthTracker, Recommendation, TrackedStatus, TrackingMetadata,
};
use conductor::Error;

use crate::fixtures::Harness;

const MINUTE: Duration = Duration::from_secs(60);

async fn start_tracked(harness: &Harness, tracker: &HealthTracker) -> String {
    let callbacks = ExecutionCallbacks {
        on_stream: Some(tracker.heartbeat_callback()),
        ..ExecutionCallbacks::new()
    };
    let session_id = harness
        .manager
        .start(
            ExecutionParams::new("/tmp/project", "work").with_task("task-1"),
            callbacks,
        )
        .await
        .unwrap();
    tracker
        .register(&session_id, TrackingMetadata::default())
        .await
        .unwrap();
    session_id
}

/// Test: Zombie detection and recovery
/// Given a running execution with no heartbeat for more than ten minutes
/// When its health is checked
/// Then it is a zombie, and a later heartbeat flips it back to running
#[tokio::test(start_paused = true)]
async fn test_zombie_detected_then_recovers() {
    let harness = Harness::new(MockBehavior::Hang);
    let (tx, mut rx) = mpsc::channel(16);
    let tracker = HealthTracker::with_events(harness.manager.clone(), HealthConfig::default(), tx);
    let session_id = start_tracked(&harness, &tracker).await;

    tokio::time::advance(11 * MINUTE).await;
    let report = tracker.check_all().await;
    assert_eq!(report.zombies, 1);
    assert_eq!(report.cleaned, 0);
    assert_eq!(tracker.get(&session_id).unwrap().status, TrackedStatus::Zombie);
    assert!(matches!(
        rx.recv().await,
        Some(HealthEvent::ZombieDetected { .. })
    ));

    assert!(tracker.heartbeat(&session_id));
    let health = tracker.check_one(&session_id).await.unwrap();
    assert!(!health.is_zombie);
    assert!(health.is_alive);
    assert_eq!(health.recommendation, Recommendation::Monitor);
    assert_eq!(tracker.get(&session_id).unwrap().status, TrackedStatus::Running);
    assert!(matches!(rx.recv().await, Some(HealthEvent::Recovered { .. })));

    harness.manager.kill_all().await;
}

/// Test: Long-dead zombie is cleaned up
/// Given an execution silent for longer than the cleanup threshold
/// When the periodic sweep runs
/// Then the execution is killed and dropped from tracking after the grace delay
#[tokio::test(start_paused = true)]
async fn test_sweep_kills_and_forgets_dead_execution() {
    let harness = Harness::new(MockBehavior::Hang);
    let (tx, mut rx) = mpsc::channel(16);
    let tracker = HealthTracker::with_events(harness.manager.clone(), HealthConfig::default(), tx);
    let session_id = start_tracked(&harness, &tracker).await;

    tokio::time::advance(21 * MINUTE).await;
    let handle = tracker.start_health_check(Some(Duration::from_secs(300)));

    let mut cleaned = false;
    while let Some(event) = rx.recv().await {
        if let HealthEvent::CleanedUp { session_id: cleaned_id } = event {
            assert_eq!(cleaned_id, session_id);
            cleaned = true;
            break;
        }
    }
    assert!(cleaned);
    assert!(tracker.get(&session_id).is_none());
    assert_eq!(
        harness.manager.get(&session_id).await.unwrap().status,
        ExecutionStatus::Killed
    );

    tracker.stop_health_check();
    handle.await.unwrap();
}

/// Test: Stream events keep an execution healthy
/// Given a worker that keeps running
/// When its heartbeat callback fires
/// Then the tracked heartbeat moves forward
#[tokio::test(start_paused = true)]
async fn test_heartbeat_callback_refreshes_tracking() {
    let harness = Harness::new(MockBehavior::Hang);
    let tracker = HealthTracker::new(harness.manager.clone(), HealthConfig::default());
    let session_id = start_tracked(&harness, &tracker).await;
    let registered = tracker.get(&session_id).unwrap().last_heartbeat;

    tokio::time::advance(MINUTE).await;
    let callback = tracker.heartbeat_callback();
    callback(
        &session_id,
        &conductor::core::StreamEvent::result(true, "still here"),
    );

    let refreshed = tracker.get(&session_id).unwrap().last_heartbeat;
    assert!(refreshed > registered);
    assert_eq!(tracker.get(&session_id).unwrap().task_id.as_deref(), Some("task-1"));
    harness.manager.kill_all().await;
}

/// Test: Failed kill
/// Given a worker that refuses to die
/// When it is killed
/// Then the kill reports ProcessKillFailed and the execution is marked failed
#[tokio::test(start_paused = true)]
async fn test_unkillable_worker_marked_failed() {
    let harness = Harness::new(MockBehavior::Unkillable);
    let session_id = harness
        .manager
        .start(
            ExecutionParams::new("/tmp/project", "work"),
            ExecutionCallbacks::new(),
        )
        .await
        .unwrap();

    let result = harness.manager.kill(&session_id).await;
    assert!(matches!(result, Err(Error::ProcessKillFailed { .. })));

    let execution = harness.manager.get(&session_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(!execution.errors.is_empty());
    assert!(harness.manager.list_active().await.is_empty());
}
