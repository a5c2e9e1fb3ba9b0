//! Execution queue integration tests.
//!
//! These tests verify that queued executions are admitted by priority and
//! that an admitted execution holds its slot until it finishes.

use std::time::Duration;

use tokio_test::assert_ok;

use conductor::core::{ExecutionCallbacks, ExecutionParams, ExecutionStatus};
use conductor::orchestration::mock::MockBehavior;
use conductor::orchestration::QueueEvent;
use conductor::Error;

use crate::fixtures::Harness;

fn params(query: &str) -> ExecutionParams {
    ExecutionParams::new("/tmp/project", query)
}

/// Test: Priority order
/// Given max_concurrent = 1 and three executions queued with priorities 1, 5, 3
/// When the queue drains
/// Then they are started in the order 5, 3, 1
#[tokio::test(start_paused = true)]
async fn test_dispatch_order_follows_priority() {
    let harness = Harness::with_limits(MockBehavior::success(), 5, 1);

    let tickets: Vec<_> = [1, 5, 3]
        .into_iter()
        .map(|priority| {
            harness.queue.submit(
                params(&format!("p{}", priority)),
                ExecutionCallbacks::new(),
                priority,
                None,
            )
        })
        .collect();
    assert_eq!(harness.queue.len(), 3);

    for ticket in tickets {
        let session_id = assert_ok!(ticket.wait().await);
        harness.manager.wait_for_terminal(&session_id).await.unwrap();
    }

    let order: Vec<String> = harness
        .spawner
        .spawned()
        .into_iter()
        .map(|p| p.input_query)
        .collect();
    assert_eq!(order, vec!["p5", "p3", "p1"]);
}

/// Test: Slot held until the execution finishes
/// Given max_concurrent = 1 and a hanging first execution
/// When a second execution is queued
/// Then it waits until the first is killed
#[tokio::test(start_paused = true)]
async fn test_slot_released_when_execution_ends() {
    let harness = Harness::with_limits(MockBehavior::Hang, 5, 1);
    let mut events = harness.queue.subscribe();

    let first = harness
        .queue
        .enqueue(params("first"), ExecutionCallbacks::new(), 0, None)
        .await
        .unwrap();
    let second = harness
        .queue
        .submit(params("second"), ExecutionCallbacks::new(), 0, None);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.queue.processing_count(), 1);
    assert_eq!(harness.queue.len(), 1);
    assert_eq!(harness.spawner.spawn_count(), 1);

    harness.manager.kill(&first).await.unwrap();
    let second_id = assert_ok!(second.wait().await);
    assert_ne!(first, second_id);
    assert_eq!(
        harness.manager.get(&first).await.unwrap().status,
        ExecutionStatus::Killed
    );

    let mut started = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, QueueEvent::Started { .. }) {
            started += 1;
        }
    }
    assert_eq!(started, 2);
    harness.manager.kill_all().await;
}

/// Test: Queue timeout
/// Given a full queue
/// When a waiting item outlives its timeout
/// Then it is rejected with QueueTimeout and never started
#[tokio::test(start_paused = true)]
async fn test_waiting_item_times_out() {
    let harness = Harness::with_limits(MockBehavior::Hang, 5, 1);
    harness
        .queue
        .enqueue(params("blocker"), ExecutionCallbacks::new(), 0, None)
        .await
        .unwrap();

    let result = harness
        .queue
        .enqueue(
            params("late"),
            ExecutionCallbacks::new(),
            10,
            Some(Duration::from_secs(5)),
        )
        .await;

    assert!(matches!(result, Err(Error::QueueTimeout(_))));
    assert!(harness.queue.is_empty());
    assert_eq!(harness.spawner.spawn_count(), 1);
    harness.manager.kill_all().await;
}

/// Test: Clearing the queue
/// Given items waiting behind a busy slot
/// When the queue is cleared
/// Then every waiter is rejected with QueueCleared
#[tokio::test(start_paused = true)]
async fn test_clear_rejects_waiters() {
    let harness = Harness::with_limits(MockBehavior::Hang, 5, 1);
    harness
        .queue
        .enqueue(params("blocker"), ExecutionCallbacks::new(), 0, None)
        .await
        .unwrap();
    let waiting = harness
        .queue
        .submit(params("waiting"), ExecutionCallbacks::new(), 0, None);

    assert_eq!(harness.queue.clear(), 1);
    assert!(matches!(waiting.wait().await, Err(Error::QueueCleared)));
    harness.manager.kill_all().await;
}

/// Test: Queue deeper than the manager
/// Given a manager capped at 1 and a queue capped at 2
/// When a second execution is queued behind a hanging one
/// Then it stays queued instead of failing, and starts once the first ends
#[tokio::test(start_paused = true)]
async fn test_manager_cap_keeps_items_waiting() {
    let harness = Harness::with_limits(MockBehavior::Hang, 1, 2);
    let mut events = harness.queue.subscribe();

    let first = assert_ok!(
        harness
            .queue
            .enqueue(params("first"), ExecutionCallbacks::new(), 0, None)
            .await
    );
    let second = harness
        .queue
        .submit(params("second"), ExecutionCallbacks::new(), 0, None);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.queue.len(), 1);
    assert_eq!(harness.spawner.spawn_count(), 1);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, QueueEvent::Failed { .. }));
    }

    harness.manager.kill(&first).await.unwrap();
    let second_id = assert_ok!(second.wait().await);
    assert_eq!(
        harness.manager.get(&second_id).await.unwrap().input_query,
        "second"
    );
    harness.manager.kill_all().await;
}
