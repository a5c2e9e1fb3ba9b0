//! Heartbeat-based health tracking for executions.
//!
//! The `HealthTracker` keeps a shadow record for every registered execution
//! and compares its last heartbeat against two thresholds:
//! - past `zombie_threshold` a running execution is a zombie
//! - past `cleanup_threshold` a zombie is killed through the execution
//!   manager, marked failed, and unregistered after a short grace period
//!
//! A fresh heartbeat always brings a zombie back to running. Periodic sweeps
//! also reconcile the shadow status with the execution manager's view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::ExecutionManager;
use crate::core::{ExecutionStatus, StreamCallback};
use crate::error::{Error, Result};

/// Default time without a heartbeat before a running execution is a zombie.
pub const DEFAULT_ZOMBIE_THRESHOLD_SECS: u64 = 600; // 10 minutes

/// Default time without a heartbeat before a zombie is cleaned up.
pub const DEFAULT_CLEANUP_THRESHOLD_SECS: u64 = 1200; // 20 minutes

/// Default interval between sweeps.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;

/// Default delay between killing a zombie and forgetting it.
pub const DEFAULT_CLEANUP_GRACE_SECS: u64 = 5;

/// Thresholds and timing for health tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub zombie_threshold: Duration,
    /// Total time since the last heartbeat, not time spent as a zombie.
    pub cleanup_threshold: Duration,
    pub check_interval: Duration,
    /// Lets final events settle before the record is dropped.
    pub cleanup_grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            zombie_threshold: Duration::from_secs(DEFAULT_ZOMBIE_THRESHOLD_SECS),
            cleanup_threshold: Duration::from_secs(DEFAULT_CLEANUP_THRESHOLD_SECS),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            cleanup_grace: Duration::from_secs(DEFAULT_CLEANUP_GRACE_SECS),
        }
    }
}

/// Health view of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedStatus {
    Running,
    Zombie,
    Completed,
    Failed,
}

/// Optional routing details supplied at registration.
///
/// Missing fields are filled in from the execution record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingMetadata {
    pub agent_name: Option<String>,
    pub task_id: Option<String>,
}

/// Shadow record of a registered execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedExecution {
    pub session_id: String,
    pub pid: Option<u32>,
    pub agent_name: Option<String>,
    pub task_id: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Only ever moves forward.
    pub last_heartbeat: Instant,
    pub status: TrackedStatus,
}

/// What the tracker suggests doing about an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Monitor,
    Cleanup,
}

/// Result of checking one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    /// The execution manager still reports a live process.
    pub is_alive: bool,
    pub time_since_heartbeat: Duration,
    pub is_zombie: bool,
    pub recommendation: Recommendation,
}

/// Events emitted by the health tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// A running execution stopped sending heartbeats.
    ZombieDetected {
        session_id: String,
        since_heartbeat: Duration,
    },
    /// A zombie sent a heartbeat again.
    Recovered { session_id: String },
    /// A zombie was killed and unregistered.
    CleanedUp { session_id: String },
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub zombies: usize,
    pub cleaned: usize,
}

struct Inner {
    manager: ExecutionManager,
    config: HealthConfig,
    tracked: Mutex<HashMap<String, TrackedExecution>>,
    event_tx: Option<mpsc::Sender<HealthEvent>>,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedExecution>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: HealthEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "Health event dropped");
            }
        }
    }

    fn assess(&self, tracked: &TrackedExecution, is_alive: bool) -> HealthStatus {
        let time_since_heartbeat = tracked.last_heartbeat.elapsed();
        let is_zombie = matches!(tracked.status, TrackedStatus::Running | TrackedStatus::Zombie)
            && time_since_heartbeat > self.config.zombie_threshold;
        let recommendation = if is_zombie && time_since_heartbeat > self.config.cleanup_threshold {
            Recommendation::Cleanup
        } else {
            Recommendation::Monitor
        };
        HealthStatus {
            is_alive,
            time_since_heartbeat,
            is_zombie,
            recommendation,
        }
    }
}

/// Watches registered executions for missing heartbeats.
///
/// # Example
///
/// ```ignore
/// use tokio::sync::mpsc;
/// use conductor::orchestration::{HealthConfig, HealthTracker, TrackingMetadata};
///
/// let (tx, mut rx) = mpsc::channel(100);
/// let tracker = HealthTracker::with_events(manager.clone(), HealthConfig::default(), tx);
/// tracker.register(&session_id, TrackingMetadata::default()).await?;
/// let sweeper = tracker.start_health_check(None);
/// ```
#[derive(Clone)]
pub struct HealthTracker {
    inner: Arc<Inner>,
}

impl HealthTracker {
    pub fn new(manager: ExecutionManager, config: HealthConfig) -> Self {
        Self::build(manager, config, None)
    }

    /// Create a tracker that reports zombie and recovery events on `event_tx`.
    pub fn with_events(
        manager: ExecutionManager,
        config: HealthConfig,
        event_tx: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self::build(manager, config, Some(event_tx))
    }

    fn build(
        manager: ExecutionManager,
        config: HealthConfig,
        event_tx: Option<mpsc::Sender<HealthEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                config,
                tracked: Mutex::new(HashMap::new()),
                event_tx,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Start tracking an execution the manager already knows.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound` if the manager has no such session.
    pub async fn register(&self, session_id: &str, metadata: TrackingMetadata) -> Result<()> {
        let execution = self
            .inner
            .manager
            .get(session_id)
            .await
            .ok_or_else(|| Error::ExecutionNotFound(session_id.to_string()))?;

        let tracked = TrackedExecution {
            session_id: session_id.to_string(),
            pid: execution.pid,
            agent_name: metadata.agent_name.or(execution.agent_name),
            task_id: metadata.task_id.or(execution.task_id),
            start_time: execution.start_time,
            last_heartbeat: Instant::now(),
            status: TrackedStatus::Running,
        };
        self.inner.lock().insert(session_id.to_string(), tracked);
        debug!(session_id, pid = ?execution.pid, "Execution registered for health tracking");
        Ok(())
    }

    /// Record activity. Returns false for an untracked session.
    pub fn heartbeat(&self, session_id: &str) -> bool {
        let recovered = {
            let mut tracked = self.inner.lock();
            let Some(entry) = tracked.get_mut(session_id) else {
                return false;
            };
            let now = Instant::now();
            if now > entry.last_heartbeat {
                entry.last_heartbeat = now;
            }
            if entry.status == TrackedStatus::Zombie {
                entry.status = TrackedStatus::Running;
                true
            } else {
                false
            }
        };
        if recovered {
            info!(session_id, "Zombie execution recovered");
            self.inner.emit(HealthEvent::Recovered {
                session_id: session_id.to_string(),
            });
        }
        true
    }

    /// A stream callback that heartbeats the session it is called for.
    pub fn heartbeat_callback(&self) -> StreamCallback {
        let tracker = self.clone();
        Arc::new(move |session_id, _event| {
            tracker.heartbeat(session_id);
        })
    }

    /// Returns false for an untracked session.
    pub fn update_status(&self, session_id: &str, status: TrackedStatus) -> bool {
        match self.inner.lock().get_mut(session_id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, session_id: &str) -> Option<TrackedExecution> {
        let removed = self.inner.lock().remove(session_id);
        if removed.is_some() {
            debug!(session_id, "Execution unregistered from health tracking");
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<TrackedExecution> {
        self.inner.lock().get(session_id).cloned()
    }

    /// Every tracked execution.
    pub fn tracked(&self) -> Vec<TrackedExecution> {
        let mut tracked: Vec<TrackedExecution> = self.inner.lock().values().cloned().collect();
        tracked.sort_by_key(|t| t.start_time);
        tracked
    }

    /// Check one execution. `None` for an untracked session.
    pub async fn check_one(&self, session_id: &str) -> Option<HealthStatus> {
        let tracked = self.get(session_id)?;
        let is_alive = self.inner.manager.is_alive(session_id).await;
        Some(self.inner.assess(&tracked, is_alive))
    }

    /// Sweep every tracked execution once.
    ///
    /// Reconciles finished executions, flags zombies, and cleans up those
    /// past the cleanup threshold.
    pub async fn check_all(&self) -> SweepReport {
        let session_ids: Vec<String> = self.inner.lock().keys().cloned().collect();
        let mut report = SweepReport::default();

        for session_id in session_ids {
            let execution = self.inner.manager.get(&session_id).await;
            if let Some(execution) = execution.as_ref().filter(|e| e.is_terminal()) {
                let status = match execution.status {
                    ExecutionStatus::Completed => TrackedStatus::Completed,
                    _ => TrackedStatus::Failed,
                };
                self.update_status(&session_id, status);
            }

            let Some(tracked) = self.get(&session_id) else {
                continue;
            };
            report.checked += 1;
            let is_alive = execution
                .as_ref()
                .is_some_and(|e| e.is_active() && e.pid.is_some());
            let health = self.inner.assess(&tracked, is_alive);
            if !health.is_zombie {
                continue;
            }

            report.zombies += 1;
            if tracked.status == TrackedStatus::Running {
                self.update_status(&session_id, TrackedStatus::Zombie);
                warn!(
                    session_id = %session_id,
                    since_heartbeat = ?health.time_since_heartbeat,
                    "Zombie execution detected"
                );
                self.inner.emit(HealthEvent::ZombieDetected {
                    session_id: session_id.clone(),
                    since_heartbeat: health.time_since_heartbeat,
                });
            }
            if health.recommendation == Recommendation::Cleanup {
                self.cleanup_zombie(&session_id).await;
                report.cleaned += 1;
            }
        }

        if report.zombies > 0 {
            info!(
                checked = report.checked,
                zombies = report.zombies,
                cleaned = report.cleaned,
                "Health sweep finished"
            );
        } else {
            debug!(checked = report.checked, "Health sweep finished");
        }
        report
    }

    async fn cleanup_zombie(&self, session_id: &str) {
        match self.inner.manager.kill(session_id).await {
            Ok(()) => info!(session_id, "Zombie execution killed"),
            // The manager still marks the execution failed.
            Err(e) => warn!(session_id, error = %e, "Zombie kill failed"),
        }
        self.update_status(session_id, TrackedStatus::Failed);

        let tracker = self.clone();
        let session_id = session_id.to_string();
        let grace = self.inner.config.cleanup_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if tracker.unregister(&session_id).is_some() {
                tracker.inner.emit(HealthEvent::CleanedUp { session_id });
            }
        });
    }

    /// Start periodic sweeps, running the first one immediately.
    ///
    /// `None` uses the configured interval. Starting again replaces the
    /// previous sweeper.
    pub fn start_health_check(&self, interval: Option<Duration>) -> JoinHandle<()> {
        let interval = interval.unwrap_or(self.inner.config.check_interval);
        let token = CancellationToken::new();
        if let Some(previous) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        info!(?interval, "Health checks started");
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.check_all().await;
                    }
                }
            }
            debug!("Health checks stopped");
        })
    }

    pub fn stop_health_check(&self) {
        if let Some(token) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }
}
