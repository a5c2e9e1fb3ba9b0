//! End-to-end workflow tests.
//!
//! These tests run a task backlog through the workflow engine, the queue and
//! the execution manager, with tasks persisted in a JSON file store.

use std::time::Duration;

use conductor::core::TaskStatus;
use conductor::orchestration::mock::MockBehavior;
use conductor::orchestration::{HealthConfig, HealthTracker};
use conductor::state::{JsonFileTaskStore, TaskStore};
use conductor::workflow::{WorkflowEngine, WorkflowEvent, WorkflowStatus};

use crate::fixtures::{fast_workflow_config, task, wait_for_status, EventLog, Harness};

/// Test: Dependencies gate dispatch
/// Given task A and task B whose description says "depends on A"
/// When the workflow runs
/// Then A is returned first and B only becomes eligible once A is completed
#[tokio::test(start_paused = true)]
async fn test_dependency_runs_after_prerequisite() {
    let harness = Harness::new(MockBehavior::success());
    harness.add_tasks(vec![task("A", ""), task("B", "Wire the UI. Depends on A.")]);

    let first = harness.lifecycle.get_next_task().unwrap().unwrap();
    assert_eq!(first.id, "A");
    let check = harness.lifecycle.can_execute("B").unwrap();
    assert!(!check.can_execute);
    assert_eq!(check.blocking_tasks, vec!["A".to_string()]);

    let engine = harness.engine(fast_workflow_config());
    let log = EventLog::attach(&engine);
    assert!(engine.start().await);
    wait_for_status(&engine, WorkflowStatus::Completed).await;

    assert_eq!(harness.dispatch_order(), vec!["A", "B"]);
    for id in ["A", "B"] {
        assert_eq!(
            harness.lifecycle.get_task(id).unwrap().status,
            TaskStatus::Completed
        );
    }
    assert_eq!(log.names().last(), Some(&"workflow:completed"));
    assert_eq!(
        log.events().last(),
        Some(&WorkflowEvent::WorkflowCompleted {
            completed: 2,
            failed: 0
        })
    );
}

/// Test: Retries exhausted
/// Given max_retries = 2 and a task whose worker always fails
/// When the workflow runs
/// Then the task retries with counts 1 and 2, fails on the third attempt
/// and ends cancelled
#[tokio::test(start_paused = true)]
async fn test_task_cancelled_after_retries_exhausted() {
    let harness = Harness::new(MockBehavior::failure());
    harness.add_tasks(vec![task("flaky", "")]);

    let engine = harness.engine(fast_workflow_config());
    let log = EventLog::attach(&engine);
    engine.start().await;
    wait_for_status(&engine, WorkflowStatus::Completed).await;

    let outcomes: Vec<String> = log
        .for_task("flaky")
        .into_iter()
        .filter_map(|event| match event {
            WorkflowEvent::TaskRetrying { retry_count, .. } => {
                Some(format!("retrying({})", retry_count))
            }
            WorkflowEvent::TaskFailed { .. } => Some("failed".to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes, vec!["retrying(1)", "retrying(2)", "failed"]);
    assert_eq!(harness.spawner.spawn_count(), 3);
    assert_eq!(
        harness.lifecycle.get_task("flaky").unwrap().status,
        TaskStatus::Cancelled
    );

    let stats = engine.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.executing, 0);
}

/// Test: Retry delay is honoured
/// Given a task that fails once and then succeeds
/// When the workflow runs
/// Then the second attempt starts no sooner than the retry delay
#[tokio::test(start_paused = true)]
async fn test_retry_waits_for_delay() {
    let harness = Harness::new(MockBehavior::success());
    harness.spawner.push(MockBehavior::failure());
    harness.add_tasks(vec![task("once", "")]);

    let config = fast_workflow_config();
    let retry_delay = config.retry_delay;
    let engine = harness.engine(config);

    let mut events = engine.subscribe_channel();
    engine.start().await;

    let mut retried_at = None;
    let mut restarted_at = None;
    while restarted_at.is_none() {
        match events.recv().await.unwrap() {
            WorkflowEvent::TaskRetrying { .. } => retried_at = Some(tokio::time::Instant::now()),
            WorkflowEvent::TaskStarted { .. } if retried_at.is_some() => {
                restarted_at = Some(tokio::time::Instant::now())
            }
            _ => {}
        }
    }
    let (retried_at, restarted_at) = (retried_at.unwrap(), restarted_at.unwrap());
    assert!(restarted_at - retried_at >= retry_delay);

    wait_for_status(&engine, WorkflowStatus::Completed).await;
    assert_eq!(
        harness.lifecycle.get_task("once").unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(engine.stats().retrying, 0);
}

/// Test: Task state survives on disk
/// Given a backlog in a JSON file store
/// When the workflow completes
/// Then a fresh store over the same directory sees the final statuses
#[tokio::test(start_paused = true)]
async fn test_final_statuses_are_persisted() {
    let harness = Harness::new(MockBehavior::success());
    harness.add_tasks(vec![task("schema", ""), task("api", "requires schema")]);

    let engine = harness.engine(fast_workflow_config());
    engine.start().await;
    wait_for_status(&engine, WorkflowStatus::Completed).await;

    let reopened = JsonFileTaskStore::open(harness.tasks_dir.path()).unwrap();
    let tasks = reopened.list().unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

    let history = harness.lifecycle.history_for("api");
    let statuses: Vec<TaskStatus> = history.iter().map(|r| r.new_status).collect();
    assert_eq!(statuses, vec![TaskStatus::InProgress, TaskStatus::Completed]);
}

/// Test: Concurrency cap on tasks
/// Given four independent tasks and max_concurrent_tasks = 2
/// When the workers hang
/// Then only two executions are started
#[tokio::test(start_paused = true)]
async fn test_engine_respects_task_concurrency() {
    let harness = Harness::new(MockBehavior::Hang);
    harness.add_tasks(vec![task("t1", ""), task("t2", ""), task("t3", ""), task("t4", "")]);

    let mut config = fast_workflow_config();
    config.max_concurrent_tasks = 2;
    config.execution_timeout = None;
    let engine = harness.engine(config);
    engine.start().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.spawner.spawn_count(), 2);
    assert_eq!(engine.stats().executing, 2);
    assert_eq!(harness.dispatch_order(), vec!["t1", "t2"]);

    assert!(engine.stop().await);
    harness.manager.kill_all().await;
}

/// Test: Health tracking wiring
/// Given an engine with a health tracker
/// When a task's execution runs and finishes
/// Then it is tracked while running and unregistered afterwards
#[tokio::test(start_paused = true)]
async fn test_engine_registers_executions_for_health() {
    let harness = Harness::new(MockBehavior::Complete {
        success: true,
        exit_code: 0,
        duration: Duration::from_secs(2),
    });
    harness.add_tasks(vec![task("tracked", "")]);

    let health = HealthTracker::new(harness.manager.clone(), HealthConfig::default());
    let engine = WorkflowEngine::builder(harness.lifecycle.clone(), harness.queue.clone())
        .config(fast_workflow_config())
        .health(health.clone())
        .build();
    let mut events = engine.subscribe_channel();
    engine.start().await;

    loop {
        if let WorkflowEvent::TaskStarted { .. } = events.recv().await.unwrap() {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    let tracked = health.tracked();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].task_id.as_deref(), Some("tracked"));
    assert_eq!(tracked[0].agent_name.as_deref(), Some("backend"));

    wait_for_status(&engine, WorkflowStatus::Completed).await;
    assert!(health.tracked().is_empty());
}
