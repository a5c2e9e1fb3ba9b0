//! Core data models: executions, tasks and task dependencies.

pub mod deps;
pub mod execution;
pub mod task;

pub use deps::extract_dependencies;
pub use execution::{
    CompleteCallback, ErrorCallback, Execution, ExecutionCallbacks, ExecutionParams,
    ExecutionStatus, ResultType, StreamCallback, StreamEvent,
};
pub use task::{Task, TaskStatus, TransitionRecord};
