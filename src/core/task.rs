//! Task data model for the work backlog.
//!
//! Tasks are durable units of work routed to agents. Dependencies between
//! tasks are not stored as references: they are written into the free-text
//! description ("depends on task-3") and resolved by name at scheduling time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task status in its lifecycle.
///
/// Allowed transitions:
/// - Pending -> InProgress | Cancelled
/// - InProgress -> Completed | Pending | Cancelled
/// - Completed -> InProgress (reopen)
/// - Cancelled -> Pending (reactivate)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be picked up.
    #[default]
    Pending,
    /// Assigned to an agent and being worked on.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Abandoned, either by hand or after exhausting retries.
    Cancelled,
}

impl TaskStatus {
    /// Statuses reachable from this one.
    pub fn allowed_transitions(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::InProgress, TaskStatus::Cancelled],
            TaskStatus::InProgress => &[
                TaskStatus::Completed,
                TaskStatus::Pending,
                TaskStatus::Cancelled,
            ],
            TaskStatus::Completed => &[TaskStatus::InProgress],
            TaskStatus::Cancelled => &[TaskStatus::Pending],
        }
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Completed and cancelled tasks are never executed.
    pub fn is_closed(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// A single task in the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, also the name other tasks depend on.
    pub id: String,
    pub title: String,
    /// Free text; may embed dependency references.
    pub description: String,
    /// Agent the task is routed to.
    pub assigned_agent: String,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Notes attached when the task was completed.
    #[serde(default)]
    pub review_notes: Option<String>,
}

impl Task {
    /// Create a pending task stamped with the current time.
    pub fn new(id: &str, title: &str, description: &str, assigned_agent: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            assigned_agent: assigned_agent.to_string(),
            reviewer: None,
            status: TaskStatus::Pending,
            created: now,
            updated: now,
            review_notes: None,
        }
    }

    pub fn with_reviewer(mut self, reviewer: &str) -> Self {
        self.reviewer = Some(reviewer.to_string());
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self.updated = created;
        self
    }
}

/// Audit record of a task status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub task_id: String,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub actor: Option<String>,
}
