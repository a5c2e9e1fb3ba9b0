//! Workflow state with status transition validation.
//!
//! `WorkflowState` holds the loop status, the set of executing task ids and
//! the running totals. `RetryTracker` counts retries per task.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

use super::{WorkflowStats, WorkflowStatus};

/// A record of a status change with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct StatusHistoryEntry {
    /// The status that was entered.
    pub status: WorkflowStatus,
    /// When this status was entered.
    pub entered_at: DateTime<Utc>,
}

/// Loop status, executing tasks and totals.
///
/// Status changes follow the control operations:
///
/// - start: Idle | Completed | Failed -> Running
/// - pause: Running -> Paused
/// - resume: Paused -> Running
/// - stop: Running | Paused -> Idle
/// - the loop itself: Running -> Completed | Failed
#[derive(Debug, Clone)]
pub struct WorkflowState {
    status: WorkflowStatus,
    executing: HashSet<String>,
    completed: usize,
    failed: usize,
    status_history: Vec<StatusHistoryEntry>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowState {
    pub fn new() -> Self {
        Self {
            status: WorkflowStatus::Idle,
            executing: HashSet::new(),
            completed: 0,
            failed: 0,
            status_history: vec![StatusHistoryEntry {
                status: WorkflowStatus::Idle,
                entered_at: Utc::now(),
            }],
        }
    }

    /// Check if a change to the target status is valid from the current one.
    pub fn can_transition(&self, target: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self.status, target),
            (Idle | Completed | Failed, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running | Paused, Idle)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    /// Move to a new status.
    ///
    /// Returns `InvalidTransition` if the change is not allowed.
    pub fn transition(&mut self, target: WorkflowStatus) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        // A fresh run starts its totals over.
        if target == WorkflowStatus::Running && self.status != WorkflowStatus::Paused {
            self.completed = 0;
            self.failed = 0;
        }
        self.status = target;
        self.status_history.push(StatusHistoryEntry {
            status: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn status_history(&self) -> &[StatusHistoryEntry] {
        &self.status_history
    }

    /// Returns false if the task was already executing.
    pub fn begin_task(&mut self, task_id: &str) -> bool {
        self.executing.insert(task_id.to_string())
    }

    pub fn end_task(&mut self, task_id: &str) {
        self.executing.remove(task_id);
    }

    pub fn executing(&self) -> &HashSet<String> {
        &self.executing
    }

    pub fn record_completed(&mut self) {
        self.completed += 1;
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn stats(&self, retrying: usize) -> WorkflowStats {
        WorkflowStats {
            status: self.status,
            completed: self.completed,
            failed: self.failed,
            executing: self.executing.len(),
            retrying,
        }
    }
}

/// Tracks retry counts per task.
///
/// # Example
///
/// ```
/// use conductor::workflow::RetryTracker;
///
/// let mut tracker = RetryTracker::new();
///
/// assert_eq!(tracker.get_retries("task-1"), 0);
/// tracker.increment("task-1");
/// assert_eq!(tracker.get_retries("task-1"), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<String, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 if the task has not been retried.
    pub fn get_retries(&self, task_id: &str) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Increment the retry count for a task, returning the new count.
    pub fn increment(&mut self, task_id: &str) -> u32 {
        let count = self.retries.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, task_id: &str) {
        self.retries.remove(task_id);
    }

    pub fn clear(&mut self) {
        self.retries.clear();
    }

    pub fn len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}
