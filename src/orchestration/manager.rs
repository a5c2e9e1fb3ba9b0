//! Execution manager: process lifecycle and session identity.
//!
//! The `ExecutionManager` owns every live and historical `Execution`. A new
//! execution is registered in two phases: it first lives in a pending
//! registration table keyed by an internal request id, and is promoted into
//! the main table once its worker reports a session id. A resumed execution
//! already knows its id and skips straight to the main table.
//!
//! Each started process gets its own pump task carrying an `ExecutionContext`,
//! so callbacks only ever see their own execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::process::{KillSwitch, ProcessEvent, ProcessSpawner};
use crate::core::{Execution, ExecutionCallbacks, ExecutionParams, ExecutionStatus, StreamEvent};
use crate::error::{Error, Result};

/// Default cap on concurrently active executions.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Default wait for a new worker to report its session id.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// When history pruning runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionMode {
    /// After every execution reaches a terminal status.
    Inline,
    /// On a timer started with `start_retention_timer`.
    Periodic(Duration),
}

/// Bound on how many terminal executions are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// `None` keeps everything.
    pub max_history_size: Option<usize>,
    pub mode: RetentionMode,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_history_size: None,
            mode: RetentionMode::Inline,
        }
    }
}

/// Execution manager settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub max_concurrent: usize,
    pub session_timeout: Duration,
    pub retention: RetentionPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Execution counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub killed: usize,
}

impl ExecutionStats {
    pub fn active(&self) -> usize {
        self.pending + self.running
    }
}

#[derive(Default)]
struct ManagerState {
    executions: HashMap<String, Execution>,
    /// New executions still waiting for their session id.
    registrations: HashMap<Uuid, Execution>,
    kill_switches: HashMap<String, KillSwitch>,
    /// Sessions whose process was asked to terminate.
    kill_requested: HashSet<String>,
    /// Callers of `wait_for_terminal`, handed the terminal snapshot directly.
    waiters: HashMap<String, Vec<oneshot::Sender<Execution>>>,
    max_concurrent: usize,
}

impl ManagerState {
    /// Live active executions plus pending registrations.
    fn active_count(&self) -> usize {
        self.executions.values().filter(|e| e.is_active()).count() + self.registrations.len()
    }

    /// Drop the oldest terminal executions beyond `max`. Returns how many went.
    fn prune(&mut self, max: usize) -> usize {
        let mut terminal: Vec<(String, chrono::DateTime<chrono::Utc>)> = self
            .executions
            .values()
            .filter(|e| e.is_terminal())
            .map(|e| (e.session_id.clone(), e.end_time.unwrap_or(e.start_time)))
            .collect();
        if terminal.len() <= max {
            return 0;
        }
        terminal.sort_by_key(|(_, ended)| *ended);
        let excess = terminal.len() - max;
        for (session_id, _) in terminal.into_iter().take(excess) {
            self.forget(&session_id);
        }
        excess
    }

    fn forget(&mut self, session_id: &str) {
        self.executions.remove(session_id);
        self.kill_switches.remove(session_id);
        self.kill_requested.remove(session_id);
        self.waiters.remove(session_id);
    }

    /// Hand a terminal execution to everyone waiting on it.
    ///
    /// Must run before pruning, which may drop the record in the same turn.
    fn settle(&mut self, session_id: &str) {
        let Some(execution) = self.executions.get(session_id).filter(|e| e.is_terminal()) else {
            return;
        };
        if let Some(waiters) = self.waiters.remove(session_id) {
            for waiter in waiters {
                let _ = waiter.send(execution.clone());
            }
        }
    }
}

struct Shared {
    spawner: Arc<dyn ProcessSpawner>,
    state: RwLock<ManagerState>,
    config: ExecutionConfig,
    changed: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl Shared {
    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn prune_inline(&self, state: &mut ManagerState) -> usize {
        match (self.config.retention.mode, self.config.retention.max_history_size) {
            (RetentionMode::Inline, Some(max)) => state.prune(max),
            _ => 0,
        }
    }
}

/// Owns the map of executions and the processes behind them.
///
/// Cloning is cheap; every clone talks to the same state.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use conductor::core::{ExecutionCallbacks, ExecutionParams};
/// use conductor::orchestration::{CommandSpawner, ExecutionConfig, ExecutionManager, WorkerCommand};
///
/// let spawner = Arc::new(CommandSpawner::new(WorkerCommand::default())?);
/// let manager = ExecutionManager::new(spawner, ExecutionConfig::default())?;
/// let session_id = manager
///     .start(ExecutionParams::new("/path/to/project", "fix the tests"), ExecutionCallbacks::new())
///     .await?;
/// ```
#[derive(Clone)]
pub struct ExecutionManager {
    shared: Arc<Shared>,
}

impl ExecutionManager {
    /// Create a manager.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `max_concurrent` is below 1.
    pub fn new(spawner: Arc<dyn ProcessSpawner>, config: ExecutionConfig) -> Result<Self> {
        if config.max_concurrent < 1 {
            return Err(Error::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        let (changed, _) = watch::channel(0);
        let state = ManagerState {
            max_concurrent: config.max_concurrent,
            ..Default::default()
        };
        Ok(Self {
            shared: Arc::new(Shared {
                spawner,
                state: RwLock::new(state),
                config,
                changed,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.shared.config
    }

    /// Start an execution and return its session id.
    ///
    /// With an explicit session id the execution is registered under it
    /// right after the process starts. Otherwise the call waits, up to the
    /// session timeout, for the worker to report its id.
    ///
    /// # Errors
    ///
    /// - `CapacityExceeded` if a new execution would exceed `max_concurrent`
    /// - `SessionExists` if a resumed session is still active
    /// - `ProcessStartFailed` if the process cannot start, or exits before
    ///   reporting a session id
    /// - `SessionResolutionTimeout` if no session id arrives in time
    pub async fn start(
        &self,
        params: ExecutionParams,
        callbacks: ExecutionCallbacks,
    ) -> Result<String> {
        if params.is_resume() {
            return self.start_resumed(params, callbacks).await;
        }

        let request_id = Uuid::new_v4();
        {
            let mut state = self.shared.state.write().await;
            let active = state.active_count();
            if active >= state.max_concurrent {
                warn!(
                    active,
                    max = state.max_concurrent,
                    "Execution rejected: at capacity"
                );
                return Err(Error::CapacityExceeded {
                    max: state.max_concurrent,
                });
            }
            state
                .registrations
                .insert(request_id, Execution::from_params(&params));
        }

        let handle = match self.shared.spawner.spawn(&params) {
            Ok(handle) => handle,
            Err(e) => {
                let mut state = self.shared.state.write().await;
                if let Some(mut execution) = state.registrations.remove(&request_id) {
                    execution.finish(ExecutionStatus::Failed);
                }
                error!(request_id = %request_id, error = %e, "Worker process failed to start");
                return Err(as_start_failure(e));
            }
        };

        {
            let mut state = self.shared.state.write().await;
            if let Some(execution) = state.registrations.get_mut(&request_id) {
                execution.status = ExecutionStatus::Running;
                execution.pid = handle.pid;
            }
        }
        debug!(request_id = %request_id, pid = ?handle.pid, "Waiting for session id");

        let (resolved_tx, mut resolved_rx) = oneshot::channel();
        let kill = handle.kill.clone();
        let context = ExecutionContext {
            shared: Arc::clone(&self.shared),
            slot: Slot::Pending(request_id),
            callbacks,
            kill: handle.kill,
            resolved: Some(resolved_tx),
        };
        tokio::spawn(context.pump(handle.events));

        let timeout = self.shared.config.session_timeout;
        match tokio::time::timeout(timeout, &mut resolved_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ProcessStartFailed(
                "event stream closed before a session id was reported".to_string(),
            )),
            Err(_) => {
                let mut state = self.shared.state.write().await;
                // Promotion happens under the lock, so it either landed already or never will.
                if let Ok(result) = resolved_rx.try_recv() {
                    return result;
                }
                if let Some(mut execution) = state.registrations.remove(&request_id) {
                    execution.finish(ExecutionStatus::Failed);
                }
                drop(state);

                warn!(request_id = %request_id, ?timeout, "Session id not reported in time");
                if let Err(e) = kill.kill().await {
                    warn!(request_id = %request_id, error = %e, "Failed to kill unresolved worker");
                }
                Err(Error::SessionResolutionTimeout(timeout))
            }
        }
    }

    async fn start_resumed(
        &self,
        params: ExecutionParams,
        callbacks: ExecutionCallbacks,
    ) -> Result<String> {
        let session_id = params.session_id.clone().unwrap_or_default();
        let mut state = self.shared.state.write().await;
        if state
            .executions
            .get(&session_id)
            .is_some_and(Execution::is_active)
        {
            return Err(Error::SessionExists(session_id));
        }

        let mut execution = Execution::from_params(&params);
        let handle = match self.shared.spawner.spawn(&params) {
            Ok(handle) => handle,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Resumed worker failed to start");
                execution.errors.push(e.to_string());
                execution.finish(ExecutionStatus::Failed);
                state.executions.insert(session_id, execution);
                drop(state);
                self.shared.notify();
                return Err(as_start_failure(e));
            }
        };

        execution.status = ExecutionStatus::Running;
        execution.pid = handle.pid;
        state.executions.insert(session_id.clone(), execution);
        state
            .kill_switches
            .insert(session_id.clone(), handle.kill.clone());
        drop(state);

        info!(session_id = %session_id, pid = ?handle.pid, "Execution resumed");
        self.shared.notify();

        let context = ExecutionContext {
            shared: Arc::clone(&self.shared),
            slot: Slot::Live(session_id.clone()),
            callbacks,
            kill: handle.kill,
            resolved: None,
        };
        tokio::spawn(context.pump(handle.events));
        Ok(session_id)
    }

    /// Terminate a running execution.
    ///
    /// Killing a terminal execution is a no-op. The execution always ends
    /// up terminal: `Killed`, or `Failed` when the kill signal errors.
    ///
    /// # Errors
    ///
    /// - `ExecutionNotFound` for an unknown session id
    /// - `ProcessKillFailed` if the signal could not be delivered
    pub async fn kill(&self, session_id: &str) -> Result<()> {
        let switch = {
            let mut state = self.shared.state.write().await;
            let execution = state
                .executions
                .get(session_id)
                .ok_or_else(|| Error::ExecutionNotFound(session_id.to_string()))?;
            if execution.is_terminal() {
                warn!(session_id, status = %execution.status, "Kill on finished execution ignored");
                return Ok(());
            }
            state.kill_requested.insert(session_id.to_string());
            state.kill_switches.get(session_id).cloned()
        };

        let signal = match switch {
            Some(switch) => switch.kill().await,
            None => Ok(()),
        };

        let mut state = self.shared.state.write().await;
        let outcome = match signal {
            Ok(()) => {
                if let Some(execution) = state.executions.get_mut(session_id) {
                    execution.finish(ExecutionStatus::Killed);
                }
                info!(session_id, "Execution killed");
                Ok(())
            }
            Err(e) => {
                state.kill_requested.remove(session_id);
                if let Some(execution) = state.executions.get_mut(session_id) {
                    execution.errors.push(format!("kill failed: {}", e));
                    execution.finish(ExecutionStatus::Failed);
                }
                error!(session_id, error = %e, "Kill signal failed, execution marked failed");
                Err(Error::ProcessKillFailed {
                    session_id: session_id.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        state.settle(session_id);
        self.shared.prune_inline(&mut state);
        drop(state);
        self.shared.notify();
        outcome
    }

    /// Kill every active execution. Returns how many kills were attempted.
    pub async fn kill_all(&self) -> usize {
        let active: Vec<String> = self
            .list_active()
            .await
            .into_iter()
            .map(|e| e.session_id)
            .collect();
        let kills = active.iter().map(|session_id| async move {
            if let Err(e) = self.kill(session_id).await {
                warn!(session_id = %session_id, error = %e, "kill_all: kill failed");
            }
        });
        join_all(kills).await;
        info!(count = active.len(), "Killed all active executions");
        active.len()
    }

    /// Remove a terminal execution.
    ///
    /// # Errors
    ///
    /// - `ExecutionNotFound` for an unknown session id
    /// - `ExecutionStillActive` if the execution is pending or running
    pub async fn cleanup(&self, session_id: &str) -> Result<()> {
        let mut state = self.shared.state.write().await;
        let execution = state
            .executions
            .get(session_id)
            .ok_or_else(|| Error::ExecutionNotFound(session_id.to_string()))?;
        if execution.is_active() {
            return Err(Error::ExecutionStillActive(session_id.to_string()));
        }
        state.forget(session_id);
        drop(state);

        debug!(session_id, "Execution cleaned up");
        self.shared.notify();
        Ok(())
    }

    /// Remove every terminal execution. Returns how many were removed.
    pub async fn cleanup_all_completed(&self) -> usize {
        let mut state = self.shared.state.write().await;
        let finished: Vec<String> = state
            .executions
            .values()
            .filter(|e| e.is_terminal())
            .map(|e| e.session_id.clone())
            .collect();
        for session_id in &finished {
            state.forget(session_id);
        }
        drop(state);

        if !finished.is_empty() {
            info!(count = finished.len(), "Cleaned up finished executions");
            self.shared.notify();
        }
        finished.len()
    }

    /// Change the concurrency cap. Running executions are not affected.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `max` is below 1.
    pub async fn set_max_concurrent(&self, max: usize) -> Result<()> {
        if max < 1 {
            return Err(Error::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        self.shared.state.write().await.max_concurrent = max;
        info!(max, "Execution concurrency changed");
        Ok(())
    }

    pub async fn max_concurrent(&self) -> usize {
        self.shared.state.read().await.max_concurrent
    }

    pub async fn get(&self, session_id: &str) -> Option<Execution> {
        self.shared.state.read().await.executions.get(session_id).cloned()
    }

    /// Every execution, oldest first.
    pub async fn list(&self) -> Vec<Execution> {
        self.collect(|_| true).await
    }

    /// Pending and running executions.
    pub async fn list_active(&self) -> Vec<Execution> {
        self.collect(Execution::is_active).await
    }

    /// Completed, failed and killed executions.
    pub async fn list_completed(&self) -> Vec<Execution> {
        self.collect(Execution::is_terminal).await
    }

    async fn collect(&self, predicate: impl Fn(&Execution) -> bool) -> Vec<Execution> {
        let state = self.shared.state.read().await;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.start_time);
        executions
    }

    pub async fn stats(&self) -> ExecutionStats {
        let state = self.shared.state.read().await;
        let mut stats = ExecutionStats::default();
        for execution in state.executions.values() {
            stats.total += 1;
            match execution.status {
                ExecutionStatus::Pending => stats.pending += 1,
                ExecutionStatus::Running => stats.running += 1,
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Killed => stats.killed += 1,
            }
        }
        stats
    }

    /// Active executions, counting new ones still waiting for a session id.
    pub async fn active_count(&self) -> usize {
        self.shared.state.read().await.active_count()
    }

    /// Whether the execution is active and has a live process id.
    pub async fn is_alive(&self, session_id: &str) -> bool {
        self.shared
            .state
            .read()
            .await
            .executions
            .get(session_id)
            .is_some_and(|e| e.is_active() && e.pid.is_some())
    }

    /// Change signal. The value is a version counter; only its changes matter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.changed.subscribe()
    }

    /// Suspend until the execution is terminal, then return it.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound` if the session is unknown or is cleaned
    /// up while still active. History pruning never races a waiter: the
    /// terminal snapshot is delivered before the record can be dropped.
    pub async fn wait_for_terminal(&self, session_id: &str) -> Result<Execution> {
        let finished = {
            let mut state = self.shared.state.write().await;
            match state.executions.get(session_id) {
                Some(execution) if execution.is_terminal() => return Ok(execution.clone()),
                Some(_) => {}
                None => return Err(Error::ExecutionNotFound(session_id.to_string())),
            }
            let (tx, rx) = oneshot::channel();
            state
                .waiters
                .entry(session_id.to_string())
                .or_default()
                .push(tx);
            rx
        };
        finished
            .await
            .map_err(|_| Error::ExecutionNotFound(session_id.to_string()))
    }

    /// Apply the history bound now. Returns how many executions were pruned.
    pub async fn prune_history(&self) -> usize {
        let Some(max) = self.shared.config.retention.max_history_size else {
            return 0;
        };
        let pruned = self.shared.state.write().await.prune(max);
        if pruned > 0 {
            debug!(pruned, max, "Pruned execution history");
            self.shared.notify();
        }
        pruned
    }

    /// Start periodic pruning when the retention mode asks for it.
    ///
    /// Returns `None` in inline mode. The timer stops on `shutdown`.
    pub fn start_retention_timer(&self) -> Option<JoinHandle<()>> {
        let RetentionMode::Periodic(interval) = self.shared.config.retention.mode else {
            return None;
        };
        let manager = self.clone();
        let token = self.shared.shutdown.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.prune_history().await;
                    }
                }
            }
            debug!("Retention timer stopped");
        }))
    }

    /// Stop background timers. Running processes are left alone.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

fn as_start_failure(e: Error) -> Error {
    match e {
        Error::ProcessStartFailed(_) => e,
        other => Error::ProcessStartFailed(other.to_string()),
    }
}

/// Where an execution currently lives in the manager.
enum Slot {
    Pending(Uuid),
    Live(String),
}

/// Everything one execution's pump needs, and nothing shared with others.
struct ExecutionContext {
    shared: Arc<Shared>,
    slot: Slot,
    callbacks: ExecutionCallbacks,
    kill: KillSwitch,
    resolved: Option<oneshot::Sender<Result<String>>>,
}

impl ExecutionContext {
    async fn pump(mut self, mut events: tokio::sync::mpsc::Receiver<ProcessEvent>) {
        let mut exit = None;
        while let Some(event) = events.recv().await {
            let tracked = match event {
                ProcessEvent::Message(event) => self.on_message(event).await,
                ProcessEvent::Error(line) => self.on_error(line).await,
                ProcessEvent::Exited { code } => {
                    exit = Some(code);
                    break;
                }
            };
            if !tracked {
                return;
            }
        }
        self.on_exit(exit).await;
    }

    /// Record one stream event. Returns false once the execution is gone.
    async fn on_message(&mut self, event: StreamEvent) -> bool {
        let mut state = self.shared.state.write().await;
        let request_id = match &self.slot {
            Slot::Live(session_id) => {
                let session_id = session_id.clone();
                if let Some(execution) = state.executions.get_mut(&session_id) {
                    execution.events.push(event.clone());
                }
                drop(state);
                if let Some(on_stream) = &self.callbacks.on_stream {
                    on_stream(&session_id, &event);
                }
                return true;
            }
            Slot::Pending(request_id) => *request_id,
        };

        let Some(execution) = state.registrations.get_mut(&request_id) else {
            return false;
        };
        execution.events.push(event.clone());
        let Some(session_id) = event.session_init_id().map(String::from) else {
            return true;
        };
        let Some(mut execution) = state.registrations.remove(&request_id) else {
            return false;
        };

        if state
            .executions
            .get(&session_id)
            .is_some_and(Execution::is_active)
        {
            drop(state);
            error!(
                session_id = %session_id,
                request_id = %request_id,
                "Worker reported a session id that is already live"
            );
            if let Some(resolved) = self.resolved.take() {
                let _ = resolved.send(Err(Error::SessionExists(session_id.clone())));
            }
            if let Err(e) = self.kill.kill().await {
                warn!(request_id = %request_id, error = %e, "Failed to kill duplicate worker");
            }
            return false;
        }

        execution.session_id = session_id.clone();
        let buffered_events = execution.events.clone();
        let buffered_errors = execution.errors.clone();
        state.executions.insert(session_id.clone(), execution);
        state
            .kill_switches
            .insert(session_id.clone(), self.kill.clone());
        if let Some(resolved) = self.resolved.take() {
            let _ = resolved.send(Ok(session_id.clone()));
        }
        drop(state);

        info!(session_id = %session_id, request_id = %request_id, "Execution promoted");
        self.slot = Slot::Live(session_id.clone());
        self.shared.notify();

        if let Some(on_stream) = &self.callbacks.on_stream {
            for event in &buffered_events {
                on_stream(&session_id, event);
            }
        }
        if let Some(on_error) = &self.callbacks.on_error {
            for line in &buffered_errors {
                on_error(&session_id, line);
            }
        }
        true
    }

    async fn on_error(&mut self, line: String) -> bool {
        let mut state = self.shared.state.write().await;
        match &self.slot {
            Slot::Live(session_id) => {
                let session_id = session_id.clone();
                if let Some(execution) = state.executions.get_mut(&session_id) {
                    execution.errors.push(line.clone());
                }
                drop(state);
                debug!(session_id = %session_id, error = %line, "Worker error output");
                if let Some(on_error) = &self.callbacks.on_error {
                    on_error(&session_id, &line);
                }
                true
            }
            Slot::Pending(request_id) => match state.registrations.get_mut(request_id) {
                Some(execution) => {
                    execution.errors.push(line);
                    true
                }
                None => false,
            },
        }
    }

    /// `exit` is `None` when the stream closed without an exit event.
    async fn on_exit(mut self, exit: Option<Option<i32>>) {
        let code = exit.flatten();
        let mut state = self.shared.state.write().await;

        let session_id = match &self.slot {
            Slot::Pending(request_id) => {
                let Some(mut execution) = state.registrations.remove(request_id) else {
                    return;
                };
                execution.exit_code = code;
                execution.finish(ExecutionStatus::Failed);
                let detail = execution
                    .errors
                    .last()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default();
                if let Some(resolved) = self.resolved.take() {
                    let _ = resolved.send(Err(Error::ProcessStartFailed(format!(
                        "worker exited with code {:?} before reporting a session id{}",
                        code, detail
                    ))));
                }
                warn!(request_id = %request_id, ?code, "Worker exited before reporting a session id");
                return;
            }
            Slot::Live(session_id) => session_id.clone(),
        };

        let status = if state.kill_requested.remove(&session_id) {
            ExecutionStatus::Killed
        } else if exit == Some(Some(0)) {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        let final_status = match state.executions.get_mut(&session_id) {
            Some(execution) => {
                execution.exit_code = execution.exit_code.or(code);
                if execution.finish(status) {
                    info!(session_id = %session_id, ?code, status = %status, "Execution finished");
                }
                Some(execution.status)
            }
            None => None,
        };
        state.kill_switches.remove(&session_id);
        state.settle(&session_id);
        self.shared.prune_inline(&mut state);
        drop(state);
        self.shared.notify();

        match (final_status, &self.callbacks.on_complete) {
            (Some(status), Some(on_complete)) => on_complete(&session_id, status),
            (None, _) => debug!(session_id = %session_id, "Execution removed before its process exited"),
            _ => {}
        }
    }
}
