//! The workflow engine: drives the task backlog through the execution queue.
//!
//! A single scheduling loop picks the next eligible task and dispatches it on
//! its own tokio task, so one slow execution never blocks admission of the
//! next. All task state goes through the `TaskLifecycleManager`, on the
//! blocking pool since its store may touch disk; the engine only keeps the
//! set of task ids it is currently running and their retry counts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{
    Execution, ExecutionCallbacks, ExecutionParams, ExecutionStatus, Task, TaskStatus,
};
use crate::error::Result;
use crate::orchestration::{
    ExecutionQueue, HealthTracker, TaskLifecycleManager, TrackingMetadata,
};
use crate::util::blocking;

use super::events::{EventBus, SubscriberId};
use super::state::{RetryTracker, WorkflowState};
use super::{WorkflowConfig, WorkflowEvent, WorkflowStats, WorkflowStatus};

const ACTOR: &str = "workflow";

/// Turns a task into the parameters of the execution that works on it.
pub trait TaskRouter: Send + Sync {
    fn route(&self, task: &Task) -> ExecutionParams;
}

/// Routes a task to its assigned agent with title and description as the query.
#[derive(Debug, Clone)]
pub struct DefaultRouter {
    project_context: String,
}

impl DefaultRouter {
    pub fn new(project_context: impl Into<String>) -> Self {
        Self {
            project_context: project_context.into(),
        }
    }
}

impl Default for DefaultRouter {
    fn default() -> Self {
        Self::new(".")
    }
}

impl TaskRouter for DefaultRouter {
    fn route(&self, task: &Task) -> ExecutionParams {
        let query = format!("{}\n\n{}", task.title, task.description);
        ExecutionParams::new(self.project_context.clone(), query)
            .with_agent(task.assigned_agent.clone())
            .with_task(task.id.clone())
    }
}

/// Judges whether a finished execution did what the task asked.
pub trait ResultEvaluator: Send + Sync {
    fn evaluate(&self, task: &Task, execution: &Execution) -> bool;
}

/// Satisfied when the execution completed and its last `result` event, if
/// any, is not an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvaluator;

impl ResultEvaluator for DefaultEvaluator {
    fn evaluate(&self, _task: &Task, execution: &Execution) -> bool {
        execution.status == ExecutionStatus::Completed
            && execution.result().map_or(true, |result| result.is_success())
    }
}

/// Builds a [`WorkflowEngine`].
pub struct WorkflowEngineBuilder {
    config: WorkflowConfig,
    lifecycle: Arc<TaskLifecycleManager>,
    queue: ExecutionQueue,
    router: Arc<dyn TaskRouter>,
    evaluator: Arc<dyn ResultEvaluator>,
    health: Option<HealthTracker>,
}

impl WorkflowEngineBuilder {
    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn router(mut self, router: impl TaskRouter + 'static) -> Self {
        self.router = Arc::new(router);
        self
    }

    pub fn evaluator(mut self, evaluator: impl ResultEvaluator + 'static) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    /// Register every dispatched execution with this tracker.
    pub fn health(mut self, health: HealthTracker) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        WorkflowEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                lifecycle: self.lifecycle,
                queue: self.queue,
                router: self.router,
                evaluator: self.evaluator,
                health: self.health,
                state: Mutex::new(WorkflowState::new()),
                retries: Mutex::new(RetryTracker::new()),
                events: EventBus::new(),
                scheduler: tokio::sync::Mutex::new(None),
            }),
        }
    }
}

struct Scheduler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner {
    config: WorkflowConfig,
    lifecycle: Arc<TaskLifecycleManager>,
    queue: ExecutionQueue,
    router: Arc<dyn TaskRouter>,
    evaluator: Arc<dyn ResultEvaluator>,
    health: Option<HealthTracker>,
    state: Mutex<WorkflowState>,
    retries: Mutex<RetryTracker>,
    events: EventBus,
    /// Held across control operations so they never interleave.
    scheduler: tokio::sync::Mutex<Option<Scheduler>>,
}

/// Outcome of one dispatch attempt.
enum Attempt {
    Succeeded { session_id: String },
    Failed { reason: String },
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn builder(
        lifecycle: Arc<TaskLifecycleManager>,
        queue: ExecutionQueue,
    ) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config: WorkflowConfig::default(),
            lifecycle,
            queue,
            router: Arc::new(DefaultRouter::default()),
            evaluator: Arc::new(DefaultEvaluator),
            health: None,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> &Arc<TaskLifecycleManager> {
        &self.inner.lifecycle
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.inner.queue
    }

    fn state(&self) -> MutexGuard<'_, WorkflowState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retries(&self) -> MutexGuard<'_, RetryTracker> {
        self.inner.retries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: WorkflowEvent) {
        self.inner.events.emit(event);
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state().status()
    }

    pub fn stats(&self) -> WorkflowStats {
        let retrying = self.retries().len();
        self.state().stats(retrying)
    }

    /// Task ids currently being dispatched or waiting out a retry delay.
    pub fn executing(&self) -> HashSet<String> {
        self.state().executing().clone()
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&WorkflowEvent) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.inner.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn subscribe_channel(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe_channel()
    }

    /// Start the loop if `auto_start` is set.
    pub async fn launch(&self) -> bool {
        if !self.inner.config.auto_start {
            debug!("Workflow auto_start disabled");
            return false;
        }
        self.start().await
    }

    /// Start the scheduling loop from idle, completed or failed.
    ///
    /// Returns false, with a warning, from any other status.
    pub async fn start(&self) -> bool {
        let mut scheduler = self.inner.scheduler.lock().await;
        if !self.enter(
            "start",
            &[WorkflowStatus::Idle, WorkflowStatus::Completed, WorkflowStatus::Failed],
            WorkflowStatus::Running,
        ) {
            return false;
        }
        retire(scheduler.take()).await;

        info!(
            max_concurrent_tasks = self.inner.config.max_concurrent_tasks,
            max_retries = self.inner.config.max_retries,
            "Workflow started"
        );
        self.emit(WorkflowEvent::WorkflowStarted);
        *scheduler = Some(self.spawn_loop());
        true
    }

    /// Stop admitting new tasks. In-flight tasks keep running.
    ///
    /// Returns once the scheduling loop has exited.
    pub async fn pause(&self) -> bool {
        let mut scheduler = self.inner.scheduler.lock().await;
        if !self.enter("pause", &[WorkflowStatus::Running], WorkflowStatus::Paused) {
            return false;
        }
        retire(scheduler.take()).await;

        info!("Workflow paused");
        self.emit(WorkflowEvent::WorkflowPaused);
        true
    }

    pub async fn resume(&self) -> bool {
        let mut scheduler = self.inner.scheduler.lock().await;
        if !self.enter("resume", &[WorkflowStatus::Paused], WorkflowStatus::Running) {
            return false;
        }
        retire(scheduler.take()).await;

        info!("Workflow resumed");
        self.emit(WorkflowEvent::WorkflowResumed);
        *scheduler = Some(self.spawn_loop());
        true
    }

    /// Stop the loop and return to idle, forgetting retry counts.
    pub async fn stop(&self) -> bool {
        let mut scheduler = self.inner.scheduler.lock().await;
        if !self.enter(
            "stop",
            &[WorkflowStatus::Running, WorkflowStatus::Paused],
            WorkflowStatus::Idle,
        ) {
            return false;
        }
        retire(scheduler.take()).await;
        self.retries().clear();

        info!("Workflow stopped");
        true
    }

    /// Move to `target` if the current status is one of `from`.
    fn enter(&self, operation: &str, from: &[WorkflowStatus], target: WorkflowStatus) -> bool {
        let mut state = self.state();
        let current = state.status();
        if !from.contains(&current) {
            warn!(status = %current, operation, "Ignoring workflow control operation");
            return false;
        }
        match state.transition(target) {
            Ok(()) => true,
            Err(e) => {
                warn!(status = %current, operation, error = %e, "Ignoring workflow control operation");
                false
            }
        }
    }

    fn spawn_loop(&self) -> Scheduler {
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_loop(token.clone()));
        Scheduler { token, handle }
    }

    /// Wait out `duration`; false if cancelled first.
    async fn idle(token: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Run a lifecycle call off the runtime threads.
    async fn with_lifecycle<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&TaskLifecycleManager) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let lifecycle = Arc::clone(&self.inner.lifecycle);
        blocking(move || f(&lifecycle)).await
    }

    async fn run_loop(self, token: CancellationToken) {
        let config = self.inner.config.clone();
        debug!("Workflow loop running");

        loop {
            if token.is_cancelled() || self.status() != WorkflowStatus::Running {
                break;
            }

            let executing = self.executing();
            if executing.len() >= config.max_concurrent_tasks {
                if !Self::idle(&token, config.poll_interval).await {
                    break;
                }
                continue;
            }

            let exclude = executing.clone();
            let next = self
                .with_lifecycle(move |lifecycle| lifecycle.get_next_task_excluding(&exclude))
                .await;
            if token.is_cancelled() || self.status() != WorkflowStatus::Running {
                break;
            }
            match next {
                Ok(Some(task)) => {
                    if !self.state().begin_task(&task.id) {
                        continue;
                    }
                    debug!(task_id = %task.id, "Dispatching task");
                    tokio::spawn(self.clone().dispatch(task));
                    if !Self::idle(&token, config.pacing_delay).await {
                        break;
                    }
                }
                Ok(None) if executing.is_empty() => {
                    self.finish();
                    break;
                }
                Ok(None) => {
                    if !Self::idle(&token, config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    self.fail(e.to_string());
                    break;
                }
            }
        }
        debug!("Workflow loop exited");
    }

    fn finish(&self) {
        let (completed, failed) = {
            let mut state = self.state();
            if state.transition(WorkflowStatus::Completed).is_err() {
                return;
            }
            (state.completed(), state.failed())
        };
        info!(completed, failed, "Workflow completed");
        self.emit(WorkflowEvent::WorkflowCompleted { completed, failed });
    }

    fn fail(&self, error: String) {
        if self.state().transition(WorkflowStatus::Failed).is_err() {
            return;
        }
        error!(error = %error, "Workflow failed");
        self.emit(WorkflowEvent::WorkflowFailed { error });
    }

    async fn dispatch(self, task: Task) {
        let task_id = task.id.clone();

        match self.attempt(&task).await {
            Attempt::Succeeded { session_id } => {
                let (id, agent) = (task_id.clone(), task.assigned_agent.clone());
                let completed = self
                    .with_lifecycle(move |lifecycle| lifecycle.complete_task(&id, Some(&agent), None))
                    .await;
                match completed {
                    Ok(_) => {
                        self.state().record_completed();
                        self.retries().reset(&task_id);
                        info!(task_id = %task_id, session_id = %session_id, "Task completed");
                        self.emit(WorkflowEvent::TaskCompleted {
                            task_id: task_id.clone(),
                            session_id,
                        });
                    }
                    Err(e) => self.handle_failure(&task_id, e.to_string()).await,
                }
            }
            Attempt::Failed { reason } => self.handle_failure(&task_id, reason).await,
        }

        self.state().end_task(&task_id);
    }

    async fn attempt(&self, task: &Task) -> Attempt {
        let agent = task.assigned_agent.as_str();
        let (id, assigned) = (task.id.clone(), agent.to_string());
        let started = self
            .with_lifecycle(move |lifecycle| lifecycle.start_task(&id, Some(&assigned)))
            .await;
        if let Err(e) = started {
            return Attempt::Failed {
                reason: e.to_string(),
            };
        }

        let params = self.inner.router.route(task);
        let mut callbacks = ExecutionCallbacks::new();
        if let Some(health) = &self.inner.health {
            callbacks.on_stream = Some(health.heartbeat_callback());
        }

        let session_id = match self
            .inner
            .queue
            .enqueue(params, callbacks, self.inner.config.priority, None)
            .await
        {
            Ok(session_id) => session_id,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, transient = e.is_transient(), "Task dispatch failed");
                return Attempt::Failed {
                    reason: e.to_string(),
                };
            }
        };

        info!(task_id = %task.id, session_id = %session_id, agent, "Task started");
        self.emit(WorkflowEvent::TaskStarted {
            task_id: task.id.clone(),
            session_id: session_id.clone(),
        });

        if let Some(health) = &self.inner.health {
            let metadata = TrackingMetadata {
                agent_name: Some(agent.to_string()),
                task_id: Some(task.id.clone()),
            };
            if let Err(e) = health.register(&session_id, metadata).await {
                warn!(session_id = %session_id, error = %e, "Failed to register execution for health tracking");
            }
        }

        let finished = self.wait_for_execution(&session_id).await;

        if let Some(health) = &self.inner.health {
            health.unregister(&session_id);
        }

        let execution = match finished {
            Ok(execution) => execution,
            Err(reason) => return Attempt::Failed { reason },
        };

        if self.inner.evaluator.evaluate(task, &execution) {
            return Attempt::Succeeded { session_id };
        }

        let reason = if execution.status == ExecutionStatus::Completed {
            format!("execution {} result judged unsatisfactory", session_id)
        } else {
            match execution.errors.last() {
                Some(last) => format!("execution {} {}: {}", session_id, execution.status, last),
                None => format!("execution {} {}", session_id, execution.status),
            }
        };
        Attempt::Failed { reason }
    }

    async fn wait_for_execution(&self, session_id: &str) -> std::result::Result<Execution, String> {
        let manager = self.inner.queue.manager();
        let waiting = manager.wait_for_terminal(session_id);

        let outcome = match self.inner.config.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(session_id, ?limit, "Execution timed out, killing it");
                    if let Err(e) = manager.kill(session_id).await {
                        warn!(session_id, error = %e, "Failed to kill timed out execution");
                    }
                    return Err(format!("execution {} timed out after {:?}", session_id, limit));
                }
            },
            None => waiting.await,
        };
        outcome.map_err(|e| e.to_string())
    }

    /// Retry the task while it has retries left, otherwise cancel it.
    async fn handle_failure(&self, task_id: &str, reason: String) {
        let max_retries = self.inner.config.max_retries;
        let retry_count = {
            let mut retries = self.retries();
            if retries.get_retries(task_id) < max_retries {
                Some(retries.increment(task_id))
            } else {
                None
            }
        };

        let id = task_id.to_string();
        match retry_count {
            Some(retry_count) => {
                let reset = self
                    .with_lifecycle(move |lifecycle| {
                        if lifecycle.get_task(&id)?.status == TaskStatus::Pending {
                            return Ok(());
                        }
                        lifecycle
                            .update_status(&id, TaskStatus::Pending, Some(ACTOR))
                            .map(|_| ())
                    })
                    .await;
                if let Err(e) = reset {
                    warn!(task_id, error = %e, "Failed to reset task to pending");
                }

                warn!(task_id, retry_count, max_retries, reason = %reason, "Task failed, retrying");
                self.emit(WorkflowEvent::TaskRetrying {
                    task_id: task_id.to_string(),
                    retry_count,
                    error: reason,
                });
                // The task stays in the executing set until the delay is over.
                tokio::time::sleep(self.inner.config.retry_delay).await;
            }
            None => {
                let cancelled = self
                    .with_lifecycle(move |lifecycle| {
                        lifecycle.update_status(&id, TaskStatus::Cancelled, Some(ACTOR))
                    })
                    .await;
                if let Err(e) = cancelled {
                    warn!(task_id, error = %e, "Failed to cancel task");
                }
                self.state().record_failed();
                error!(task_id, retries = max_retries, reason = %reason, "Task failed, retries exhausted");
                self.emit(WorkflowEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    error: reason,
                    retries: max_retries,
                });
            }
        }
    }
}

/// Cancel a scheduling loop and wait for it to exit.
async fn retire(scheduler: Option<Scheduler>) {
    if let Some(Scheduler { token, handle }) = scheduler {
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Workflow loop ended abnormally");
        }
    }
}
