//! Workflow engine: runs the task backlog to completion.
//!
//! The engine repeatedly asks the task lifecycle manager for the next
//! eligible task, dispatches it through the execution queue and applies the
//! retry policy to failed attempts. Progress is published as
//! [`WorkflowEvent`]s.

mod engine;
mod events;
mod state;
mod types;

pub use engine::{
    DefaultEvaluator, DefaultRouter, ResultEvaluator, TaskRouter, WorkflowEngine,
    WorkflowEngineBuilder,
};
pub use events::{EventBus, EventCallback, SubscriberId};
pub use state::{RetryTracker, StatusHistoryEntry, WorkflowState};
pub use types::{
    WorkflowConfig, WorkflowEvent, WorkflowStats, WorkflowStatus, DEFAULT_MAX_CONCURRENT_TASKS,
    DEFAULT_MAX_RETRIES,
};
