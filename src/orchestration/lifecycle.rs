//! Task lifecycle: the status state machine and dependency resolution.
//!
//! Every task mutation goes through `TaskLifecycleManager`, which validates
//! it against the transition table, persists it, and keeps an audit trail.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::{extract_dependencies, Task, TaskStatus, TransitionRecord};
use crate::error::{Error, Result};
use crate::state::TaskStore;

/// Whether a task may be dispatched, and if not, why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionCheck {
    pub can_execute: bool,
    pub reason: Option<String>,
    /// Dependencies that are not completed yet.
    pub blocking_tasks: Vec<String>,
}

impl ExecutionCheck {
    fn allowed() -> Self {
        Self {
            can_execute: true,
            reason: None,
            blocking_tasks: Vec::new(),
        }
    }

    fn denied(reason: String, blocking_tasks: Vec<String>) -> Self {
        Self {
            can_execute: false,
            reason: Some(reason),
            blocking_tasks,
        }
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub cancelled: usize,
    /// Tasks that pass `can_execute` right now.
    pub executable: usize,
}

/// Owns task status changes.
pub struct TaskLifecycleManager {
    store: Arc<dyn TaskStore>,
    history: Mutex<Vec<TransitionRecord>>,
    /// Serializes read-validate-write cycles.
    write_lock: Mutex<()>,
}

impl TaskLifecycleManager {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            history: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Add a new task to the store.
    ///
    /// # Errors
    ///
    /// Returns `TaskExists` if the id is taken.
    pub fn create_task(&self, task: Task) -> Result<Task> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.store.get(&task.id)?.is_some() {
            return Err(Error::TaskExists(task.id));
        }
        self.store.save(&task)?;
        info!(task_id = %task.id, agent = %task.assigned_agent, "Task created");
        Ok(task)
    }

    /// # Errors
    ///
    /// Returns `TaskNotFound` for an unknown id.
    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.store
            .get(id)?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.store.list()
    }

    /// Move a task to a new status.
    ///
    /// # Errors
    ///
    /// - `TaskNotFound` for an unknown id
    /// - `InvalidTransition` if the table does not allow the change; the
    ///   task is left untouched
    pub fn update_status(&self, id: &str, status: TaskStatus, actor: Option<&str>) -> Result<Task> {
        self.transition(id, status, actor, |_| {})
    }

    fn transition(
        &self,
        id: &str,
        status: TaskStatus,
        actor: Option<&str>,
        amend: impl FnOnce(&mut Task),
    ) -> Result<Task> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut task = self.get_task(id)?;
        let old_status = task.status;
        if !old_status.can_transition_to(status) {
            warn!(task_id = id, from = %old_status, to = %status, "Rejected task transition");
            return Err(Error::InvalidTransition {
                from: old_status.to_string(),
                to: status.to_string(),
            });
        }

        amend(&mut task);
        let now = Utc::now();
        task.status = status;
        task.updated = now;
        self.store.save(&task)?;

        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TransitionRecord {
                task_id: id.to_string(),
                old_status,
                new_status: status,
                timestamp: now,
                actor: actor.map(String::from),
            });
        info!(task_id = id, from = %old_status, to = %status, actor = ?actor, "Task transitioned");
        Ok(task)
    }

    /// Whether the task is open and all of its dependencies are completed.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for an unknown id.
    pub fn can_execute(&self, id: &str) -> Result<ExecutionCheck> {
        let task = self.get_task(id)?;
        let statuses = self.status_index()?;
        Ok(check(&task, &statuses))
    }

    /// The next task to dispatch.
    ///
    /// An eligible task already in progress wins over any pending one;
    /// pending tasks are taken oldest first.
    pub fn get_next_task(&self) -> Result<Option<Task>> {
        self.get_next_task_excluding(&HashSet::new())
    }

    /// Like `get_next_task`, skipping the given task ids.
    pub fn get_next_task_excluding(&self, exclude: &HashSet<String>) -> Result<Option<Task>> {
        let tasks = self.store.list()?;
        let statuses: HashMap<String, TaskStatus> =
            tasks.iter().map(|t| (t.id.clone(), t.status)).collect();

        let eligible = tasks
            .into_iter()
            .filter(|t| !exclude.contains(&t.id))
            .filter(|t| check(t, &statuses).can_execute);

        let mut oldest_pending: Option<Task> = None;
        for task in eligible {
            match task.status {
                TaskStatus::InProgress => {
                    debug!(task_id = %task.id, "Next task: resuming in-progress task");
                    return Ok(Some(task));
                }
                TaskStatus::Pending => {
                    if oldest_pending
                        .as_ref()
                        .map_or(true, |current| task.created < current.created)
                    {
                        oldest_pending = Some(task);
                    }
                }
                _ => {}
            }
        }
        if let Some(task) = &oldest_pending {
            debug!(task_id = %task.id, "Next task: oldest pending");
        }
        Ok(oldest_pending)
    }

    /// Re-check eligibility and move the task to in progress.
    ///
    /// Starting a task that is already in progress resumes it in place.
    ///
    /// # Errors
    ///
    /// - `TaskNotFound` for an unknown id
    /// - `TaskNotExecutable` if it is closed or blocked by dependencies
    pub fn start_task(&self, id: &str, agent: Option<&str>) -> Result<Task> {
        let verdict = self.can_execute(id)?;
        if !verdict.can_execute {
            return Err(Error::TaskNotExecutable {
                id: id.to_string(),
                reason: verdict.reason.unwrap_or_default(),
            });
        }
        let task = self.get_task(id)?;
        if task.status == TaskStatus::InProgress {
            debug!(task_id = id, "Task already in progress");
            return Ok(task);
        }
        self.update_status(id, TaskStatus::InProgress, agent)
    }

    /// Mark a task completed, attaching review notes when given.
    pub fn complete_task(&self, id: &str, agent: Option<&str>, notes: Option<&str>) -> Result<Task> {
        self.transition(id, TaskStatus::Completed, agent, |task| {
            if let Some(notes) = notes {
                task.review_notes = Some(notes.to_string());
            }
        })
    }

    pub fn task_stats(&self) -> Result<TaskStats> {
        let tasks = self.store.list()?;
        let statuses: HashMap<String, TaskStatus> =
            tasks.iter().map(|t| (t.id.clone(), t.status)).collect();

        let mut stats = TaskStats {
            total: tasks.len(),
            ..Default::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            if check(task, &statuses).can_execute {
                stats.executable += 1;
            }
        }
        Ok(stats)
    }

    /// Every transition made through this manager, oldest first.
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn history_for(&self, id: &str) -> Vec<TransitionRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.task_id == id)
            .cloned()
            .collect()
    }

    fn status_index(&self) -> Result<HashMap<String, TaskStatus>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|t| (t.id, t.status))
            .collect())
    }
}

fn check(task: &Task, statuses: &HashMap<String, TaskStatus>) -> ExecutionCheck {
    if task.status.is_closed() {
        return ExecutionCheck::denied(format!("task is {}", task.status), Vec::new());
    }

    let mut blocking = Vec::new();
    for dep in extract_dependencies(&task.description) {
        if dep == task.id {
            continue;
        }
        match statuses.get(&dep) {
            Some(TaskStatus::Completed) => {}
            Some(_) => blocking.push(dep),
            None => warn!(task_id = %task.id, dependency = %dep, "Dependency not found, ignoring"),
        }
    }

    if blocking.is_empty() {
        ExecutionCheck::allowed()
    } else {
        ExecutionCheck::denied(
            format!("waiting on {}", blocking.join(", ")),
            blocking,
        )
    }
}
