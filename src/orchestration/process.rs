//! Worker process adapter.
//!
//! The orchestrator never talks to an OS process directly. It asks a
//! `ProcessSpawner` for a `ProcessHandle`: the process id, a channel of
//! structured events and a `KillSwitch`. `CommandSpawner` is the real
//! implementation, running the worker CLI in headless mode with
//! line-delimited JSON output.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::core::{ExecutionParams, StreamEvent};
use crate::error::{Error, Result};

/// Capacity of the per-process event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the worker process produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// One structured event from stdout.
    Message(StreamEvent),
    /// A diagnostic line (stderr, or stdout that is not JSON).
    Error(String),
    /// The process exited. Always the last event.
    Exited {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
}

/// A pending request to terminate a process.
#[derive(Debug)]
pub struct KillRequest {
    reply: oneshot::Sender<std::io::Result<()>>,
}

impl KillRequest {
    /// Report the outcome of the termination attempt.
    pub fn respond(self, result: std::io::Result<()>) {
        let _ = self.reply.send(result);
    }
}

/// Receiving side of a `KillSwitch`, held by whoever owns the process.
#[derive(Debug)]
pub struct KillRequests {
    rx: mpsc::Receiver<KillRequest>,
}

impl KillRequests {
    /// Wait for the next kill request. `None` once every switch is dropped.
    pub async fn next(&mut self) -> Option<KillRequest> {
        self.rx.recv().await
    }
}

/// Cloneable capability to terminate one process.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    tx: mpsc::Sender<KillRequest>,
}

impl KillSwitch {
    pub fn channel() -> (KillSwitch, KillRequests) {
        let (tx, rx) = mpsc::channel(4);
        (KillSwitch { tx }, KillRequests { rx })
    }

    /// Ask the owner to terminate the process.
    ///
    /// A process whose owner has already gone away has exited, so that
    /// counts as success.
    pub async fn kill(&self) -> std::io::Result<()> {
        let (reply, response) = oneshot::channel();
        if self.tx.send(KillRequest { reply }).await.is_err() {
            return Ok(());
        }
        response.await.unwrap_or(Ok(()))
    }
}

/// A started worker process.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<ProcessEvent>,
    pub kill: KillSwitch,
}

/// Starts worker processes.
pub trait ProcessSpawner: Send + Sync {
    /// Spawn a worker for the given parameters.
    ///
    /// # Errors
    ///
    /// Returns `ProcessStartFailed` if the process cannot be started.
    fn spawn(&self, params: &ExecutionParams) -> Result<ProcessHandle>;
}

/// The worker command line.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    /// Program name or path.
    pub program: String,
    /// Arguments placed before the generated ones.
    pub args: Vec<String>,
    /// Model used when the execution does not choose one.
    pub model: Option<String>,
    /// Tool permissions used when the execution does not list any.
    pub allowed_tools: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: Vec::new(),
            model: None,
            allowed_tools: Vec::new(),
        }
    }
}

/// Spawns the worker CLI as a child process.
///
/// # Example
///
/// ```ignore
/// use conductor::orchestration::{CommandSpawner, WorkerCommand};
///
/// let spawner = CommandSpawner::new(WorkerCommand::default())?;
/// ```
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    command: WorkerCommand,
    binary: PathBuf,
}

impl CommandSpawner {
    /// Create a spawner, resolving the program on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerBinaryNotFound` if the program cannot be found.
    pub fn new(command: WorkerCommand) -> Result<Self> {
        let binary = which::which(&command.program)
            .map_err(|_| Error::WorkerBinaryNotFound(command.program.clone()))?;
        Ok(Self { command, binary })
    }

    /// Create a spawner for an explicit binary path.
    pub fn with_binary(command: WorkerCommand, binary: PathBuf) -> Self {
        Self { command, binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Full argument list for one execution.
    pub fn build_args(&self, params: &ExecutionParams) -> Vec<String> {
        let mut args = self.command.args.clone();
        args.push("-p".to_string());
        args.push(params.input_query.clone());
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        args.push("--verbose".to_string());

        if let Some(session_id) = params.session_id.as_deref().filter(|id| !id.is_empty()) {
            args.push("--resume".to_string());
            args.push(session_id.to_string());
        }
        if let Some(model) = params.model.as_ref().or(self.command.model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        let tools = if params.allowed_tools.is_empty() {
            &self.command.allowed_tools
        } else {
            &params.allowed_tools
        };
        if !tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
        args
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, params: &ExecutionParams) -> Result<ProcessHandle> {
        let mut command = Command::new(&self.binary);
        command
            .args(self.build_args(params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let dir = Path::new(&params.project_context);
        if !params.project_context.is_empty() && dir.is_dir() {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::ProcessStartFailed(format!("{}: {}", self.binary.display(), e)))?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProcessStartFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ProcessStartFailed("stderr not captured".to_string()))?;

        tracing::debug!(pid = ?pid, binary = %self.binary.display(), "worker process spawned");

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (kill, mut requests) = KillSwitch::channel();

        let err_tx = tx.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    let _ = err_tx.send(ProcessEvent::Error(line)).await;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut kill_open = true;

            // Forward stdout until EOF, serving kill requests meanwhile.
            loop {
                let step = tokio::select! {
                    line = lines.next_line() => Ok(line),
                    request = requests.next(), if kill_open => Err(request),
                };
                match step {
                    Ok(Ok(Some(line))) => {
                        if let Some(event) = parse_line(&line) {
                            let _ = tx.send(event).await;
                        }
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        let _ = tx.send(ProcessEvent::Error(format!("stdout read failed: {}", e))).await;
                        break;
                    }
                    Err(Some(request)) => request.respond(child.start_kill()),
                    Err(None) => kill_open = false,
                }
            }

            // Stdout is closed; the process may still be running.
            let status = loop {
                if !kill_open {
                    break child.wait().await;
                }
                let request = tokio::select! {
                    status = child.wait() => break status,
                    request = requests.next() => request,
                };
                match request {
                    Some(request) => request.respond(child.start_kill()),
                    None => kill_open = false,
                }
            };

            let _ = stderr_task.await;
            let code = status.ok().and_then(|s| s.code());
            tracing::debug!(pid = ?pid, code = ?code, "worker process exited");
            let _ = tx.send(ProcessEvent::Exited { code }).await;
        });

        Ok(ProcessHandle { pid, events, kill })
    }
}

/// Interpret one stdout line. Blank lines carry nothing.
fn parse_line(line: &str) -> Option<ProcessEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match StreamEvent::parse(trimmed) {
        Ok(event) => Some(ProcessEvent::Message(event)),
        Err(_) => Some(ProcessEvent::Error(format!("unparseable output: {}", trimmed))),
    }
}
