//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building a manager, queue and lifecycle manager over a mock spawner
//! - File-backed task backlogs in a temporary directory
//! - Recording workflow events

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use conductor::core::Task;
use conductor::orchestration::mock::{MockBehavior, MockSpawner};
use conductor::orchestration::{
    ExecutionConfig, ExecutionManager, ExecutionQueue, QueueConfig, TaskLifecycleManager,
};
use conductor::state::JsonFileTaskStore;
use conductor::workflow::{WorkflowConfig, WorkflowEngine, WorkflowEvent, WorkflowStatus};

/// Everything a scenario needs, wired over one mock spawner.
pub struct Harness {
    pub spawner: Arc<MockSpawner>,
    pub manager: ExecutionManager,
    pub queue: ExecutionQueue,
    pub lifecycle: Arc<TaskLifecycleManager>,
    /// Keeps the task directory alive for the test's duration.
    pub tasks_dir: TempDir,
}

impl Harness {
    pub fn new(behavior: MockBehavior) -> Self {
        Self::with_limits(behavior, 5, 5)
    }

    pub fn with_limits(behavior: MockBehavior, max_executions: usize, max_queue: usize) -> Self {
        let spawner = Arc::new(MockSpawner::with_default(behavior));
        let manager = ExecutionManager::new(
            spawner.clone(),
            ExecutionConfig {
                max_concurrent: max_executions,
                ..ExecutionConfig::default()
            },
        )
        .expect("valid execution config");
        let queue = ExecutionQueue::new(
            manager.clone(),
            QueueConfig {
                max_concurrent: max_queue,
            },
        )
        .expect("valid queue config");

        let tasks_dir = TempDir::new().expect("Failed to create temp directory");
        let store = JsonFileTaskStore::open(tasks_dir.path()).expect("Failed to open task store");
        let lifecycle = Arc::new(TaskLifecycleManager::new(Arc::new(store)));

        Self {
            spawner,
            manager,
            queue,
            lifecycle,
            tasks_dir,
        }
    }

    /// Add tasks in order, each one second older than the next.
    pub fn add_tasks(&self, tasks: Vec<Task>) {
        let base = chrono::Utc::now() - chrono::Duration::seconds(tasks.len() as i64);
        for (offset, task) in tasks.into_iter().enumerate() {
            let created = base + chrono::Duration::seconds(offset as i64);
            self.lifecycle
                .create_task(task.with_created(created))
                .expect("Failed to create task");
        }
    }

    pub fn engine(&self, config: WorkflowConfig) -> WorkflowEngine {
        WorkflowEngine::builder(Arc::clone(&self.lifecycle), self.queue.clone())
            .config(config)
            .router(conductor::workflow::DefaultRouter::new(
                self.tasks_dir.path().display().to_string(),
            ))
            .build()
    }

    /// Task ids in the order their executions were spawned.
    pub fn dispatch_order(&self) -> Vec<String> {
        self.spawner
            .spawned()
            .into_iter()
            .filter_map(|params| params.task_id)
            .collect()
    }
}

/// Workflow settings scaled down for tests.
pub fn fast_workflow_config() -> WorkflowConfig {
    WorkflowConfig {
        max_concurrent_tasks: 3,
        max_retries: 2,
        retry_delay: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
        pacing_delay: Duration::from_millis(1),
        execution_timeout: Some(Duration::from_secs(30)),
        ..WorkflowConfig::default()
    }
}

pub fn task(id: &str, description: &str) -> Task {
    Task::new(id, &format!("Task {}", id), description, "backend")
}

/// Captures every event the engine publishes.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<WorkflowEvent>>>,
}

impl EventLog {
    pub fn attach(engine: &WorkflowEngine) -> Self {
        let log = Self::default();
        let sink = Arc::clone(&log.events);
        engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(WorkflowEvent::name).collect()
    }

    pub fn for_task(&self, task_id: &str) -> Vec<WorkflowEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.task_id() == Some(task_id))
            .collect()
    }
}

/// Poll until the engine reaches `status`, failing after a generous bound.
pub async fn wait_for_status(engine: &WorkflowEngine, status: WorkflowStatus) {
    for _ in 0..20_000 {
        if engine.status() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("workflow stuck in {} waiting for {}", engine.status(), status);
}
