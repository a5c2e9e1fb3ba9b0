//! Mock process spawner for testing.
//!
//! Plays back scripted worker behaviours instead of running real processes,
//! making it easy to write deterministic tests for the execution manager,
//! the queue and the workflow engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use super::process::{KillRequests, KillSwitch, ProcessEvent, ProcessHandle, ProcessSpawner};
use crate::core::{ExecutionParams, StreamEvent};
use crate::error::{Error, Result};

/// How a mock worker behaves once spawned.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Announce a session, work for `duration`, report a result and exit.
    Complete {
        success: bool,
        exit_code: i32,
        duration: Duration,
    },
    /// Announce a session, then run until killed.
    Hang,
    /// Never announce a session; run until killed.
    Silent,
    /// Exit before announcing a session.
    ExitBeforeInit { exit_code: i32 },
    /// Fail to spawn at all.
    FailSpawn,
    /// Announce a session; every kill attempt fails.
    Unkillable,
    /// Emit these events verbatim, then run until killed unless the script exits.
    Script(Vec<ProcessEvent>),
}

impl MockBehavior {
    /// A worker that succeeds after a short delay.
    pub fn success() -> Self {
        MockBehavior::Complete {
            success: true,
            exit_code: 0,
            duration: Duration::from_millis(10),
        }
    }

    /// A worker that exits non-zero after a short delay.
    pub fn failure() -> Self {
        MockBehavior::Complete {
            success: false,
            exit_code: 1,
            duration: Duration::from_millis(10),
        }
    }
}

/// A test double that records spawn requests and plays back behaviours.
///
/// Behaviours pushed with `push` are consumed one per spawn, in order;
/// afterwards every spawn uses the default behaviour.
pub struct MockSpawner {
    default: MockBehavior,
    scripted: Mutex<VecDeque<MockBehavior>>,
    spawned: Mutex<Vec<ExecutionParams>>,
    next_pid: AtomicU32,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self::with_default(MockBehavior::success())
    }

    pub fn with_default(default: MockBehavior) -> Self {
        Self {
            default,
            scripted: Mutex::new(VecDeque::new()),
            spawned: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(1000),
        }
    }

    /// Queue a behaviour for the next spawn.
    pub fn push(&self, behavior: MockBehavior) {
        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(behavior);
    }

    /// Every spawn request received, in order.
    pub fn spawned(&self) -> Vec<ExecutionParams> {
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_behavior(&self) -> MockBehavior {
        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(&self, params: &ExecutionParams) -> Result<ProcessHandle> {
        let behavior = self.next_behavior();
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(params.clone());

        if behavior == MockBehavior::FailSpawn {
            return Err(Error::ProcessStartFailed("mock spawn failure".to_string()));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let session_id = params
            .session_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("mock-session-{}", pid));

        let (tx, events) = mpsc::channel(64);
        let (kill, requests) = KillSwitch::channel();
        tokio::spawn(drive(behavior, session_id, tx, requests));

        Ok(ProcessHandle {
            pid: Some(pid),
            events,
            kill,
        })
    }
}

async fn drive(
    behavior: MockBehavior,
    session_id: String,
    tx: mpsc::Sender<ProcessEvent>,
    mut requests: KillRequests,
) {
    let init = ProcessEvent::Message(StreamEvent::session_init(&session_id));
    match behavior {
        MockBehavior::Complete {
            success,
            exit_code,
            duration,
        } => {
            let _ = tx.send(init).await;
            let _ = tx
                .send(ProcessEvent::Message(StreamEvent(serde_json::json!({
                    "type": "assistant",
                    "session_id": session_id,
                    "message": "working",
                }))))
                .await;
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                request = requests.next() => {
                    if let Some(request) = request {
                        request.respond(Ok(()));
                    }
                    let _ = tx.send(ProcessEvent::Exited { code: None }).await;
                    return;
                }
            }
            let text = if success { "done" } else { "task failed" };
            let _ = tx
                .send(ProcessEvent::Message(StreamEvent::result(success, text)))
                .await;
            let _ = tx.send(ProcessEvent::Exited { code: Some(exit_code) }).await;
        }
        MockBehavior::Hang => {
            let _ = tx.send(init).await;
            run_until_killed(&tx, &mut requests).await;
        }
        MockBehavior::Silent => run_until_killed(&tx, &mut requests).await,
        MockBehavior::ExitBeforeInit { exit_code } => {
            let _ = tx
                .send(ProcessEvent::Error("worker crashed during startup".to_string()))
                .await;
            let _ = tx.send(ProcessEvent::Exited { code: Some(exit_code) }).await;
        }
        MockBehavior::FailSpawn => {}
        MockBehavior::Unkillable => {
            let _ = tx.send(init).await;
            while let Some(request) = requests.next().await {
                request.respond(Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "operation not permitted",
                )));
            }
        }
        MockBehavior::Script(events) => {
            for event in events {
                let exits = matches!(event, ProcessEvent::Exited { .. });
                let _ = tx.send(event).await;
                if exits {
                    return;
                }
            }
            run_until_killed(&tx, &mut requests).await;
        }
    }
}

async fn run_until_killed(tx: &mpsc::Sender<ProcessEvent>, requests: &mut KillRequests) {
    match requests.next().await {
        Some(request) => {
            request.respond(Ok(()));
            let _ = tx.send(ProcessEvent::Exited { code: None }).await;
        }
        // Every kill switch is gone; keep the stream open until the reader leaves.
        None => tx.closed().await,
    }
}
