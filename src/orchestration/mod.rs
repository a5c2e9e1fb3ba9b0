//! Orchestration layer: running worker processes and the tasks they serve.
//!
//! - [`ExecutionManager`] owns every worker execution and enforces the
//!   concurrency limit.
//! - [`ExecutionQueue`] admits executions by priority within its own limit.
//! - [`TaskLifecycleManager`] owns task status changes and dependency checks.
//! - [`HealthTracker`] watches running executions for missed heartbeats.
//!
//! Worker processes are reached through the [`ProcessSpawner`] trait;
//! [`CommandSpawner`] runs the real worker binary and [`mock::MockSpawner`]
//! plays back scripted behaviours for tests.

mod health;
mod lifecycle;
mod manager;
pub mod mock;
mod process;
mod queue;

pub use health::{
    HealthConfig, HealthEvent, HealthStatus, HealthTracker, Recommendation, SweepReport,
    TrackedExecution, TrackedStatus, TrackingMetadata,
};
pub use lifecycle::{ExecutionCheck, TaskLifecycleManager, TaskStats};
pub use manager::{
    ExecutionConfig, ExecutionManager, ExecutionStats, RetentionMode, RetentionPolicy,
    DEFAULT_MAX_CONCURRENT, DEFAULT_SESSION_TIMEOUT,
};
pub use process::{
    CommandSpawner, KillRequest, KillRequests, KillSwitch, ProcessEvent, ProcessHandle,
    ProcessSpawner, WorkerCommand,
};
pub use queue::{ExecutionQueue, QueueConfig, QueueEvent, QueueTicket};
