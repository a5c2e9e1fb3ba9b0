//! Core workflow type definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Status of the workflow loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Not started, or stopped
    #[default]
    Idle,
    /// The scheduling loop is admitting tasks
    Running,
    /// No new tasks are admitted; in-flight ones continue
    Paused,
    /// No eligible task was left and nothing was executing
    Completed,
    /// The loop hit an unrecoverable error
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Idle => write!(f, "idle"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Default number of tasks executing at once.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 3;

/// Default retries before a task is cancelled.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for the workflow engine.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    pub max_concurrent_tasks: usize,
    /// A task failing `max_retries + 1` times is cancelled.
    pub max_retries: u32,
    /// How long a failed task waits before it is eligible again.
    pub retry_delay: Duration,
    /// Whether `launch` starts the loop.
    pub auto_start: bool,
    /// Idle wait while at capacity or waiting on running tasks.
    pub poll_interval: Duration,
    /// Pause after each dispatch.
    pub pacing_delay: Duration,
    /// Upper bound on one execution; `None` waits forever.
    pub execution_timeout: Option<Duration>,
    /// Queue priority for dispatched executions.
    pub priority: i32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(5000),
            auto_start: false,
            poll_interval: Duration::from_millis(1000),
            pacing_delay: Duration::from_millis(100),
            execution_timeout: Some(Duration::from_secs(30 * 60)),
            priority: 0,
        }
    }
}

/// Lifecycle events published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    WorkflowStarted,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted { completed: usize, failed: usize },
    WorkflowFailed { error: String },
    TaskStarted { task_id: String, session_id: String },
    TaskCompleted { task_id: String, session_id: String },
    /// Retries exhausted; the task was cancelled.
    TaskFailed {
        task_id: String,
        error: String,
        retries: u32,
    },
    TaskRetrying {
        task_id: String,
        retry_count: u32,
        error: String,
    },
}

impl WorkflowEvent {
    /// Event name, e.g. `task:retrying`.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted => "workflow:started",
            WorkflowEvent::WorkflowPaused => "workflow:paused",
            WorkflowEvent::WorkflowResumed => "workflow:resumed",
            WorkflowEvent::WorkflowCompleted { .. } => "workflow:completed",
            WorkflowEvent::WorkflowFailed { .. } => "workflow:failed",
            WorkflowEvent::TaskStarted { .. } => "task:started",
            WorkflowEvent::TaskCompleted { .. } => "task:completed",
            WorkflowEvent::TaskFailed { .. } => "task:failed",
            WorkflowEvent::TaskRetrying { .. } => "task:retrying",
        }
    }

    /// The task the event is about, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::TaskStarted { task_id, .. }
            | WorkflowEvent::TaskCompleted { task_id, .. }
            | WorkflowEvent::TaskFailed { task_id, .. }
            | WorkflowEvent::TaskRetrying { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowEvent::WorkflowCompleted { completed, failed } => {
                write!(f, "{} completed={} failed={}", self.name(), completed, failed)
            }
            WorkflowEvent::WorkflowFailed { error } => write!(f, "{} {}", self.name(), error),
            WorkflowEvent::TaskStarted { task_id, session_id }
            | WorkflowEvent::TaskCompleted { task_id, session_id } => {
                write!(f, "{} {} session={}", self.name(), task_id, session_id)
            }
            WorkflowEvent::TaskFailed { task_id, error, retries } => {
                write!(f, "{} {} retries={} {}", self.name(), task_id, retries, error)
            }
            WorkflowEvent::TaskRetrying {
                task_id,
                retry_count,
                error,
            } => write!(f, "{} {} count={} {}", self.name(), task_id, retry_count, error),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Running totals for a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowStats {
    pub status: WorkflowStatus,
    pub completed: usize,
    pub failed: usize,
    pub executing: usize,
    /// Tasks with at least one retry recorded.
    pub retrying: usize,
}
