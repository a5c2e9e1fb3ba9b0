//! Execution data model.
//!
//! An `Execution` is one invocation of an external worker process. Its
//! durable identity is the session id the worker reports about itself (or the
//! id the caller resumes), and it accumulates every structured event and
//! error string the worker produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Submitted, process not yet running.
    #[default]
    Pending,
    /// The worker process is running.
    Running,
    /// The worker exited successfully.
    Completed,
    /// The worker exited with an error, failed to start, or could not be killed.
    Failed,
    /// The worker was terminated on request.
    Killed,
}

impl ExecutionStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Killed
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Killed => write!(f, "killed"),
        }
    }
}

/// Outcome reported by a worker's terminal `result` event.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultType {
    /// Successful execution with output.
    Success {
        /// The text output from the worker.
        output: String,
    },
    /// Failed execution with error message.
    Error {
        /// The error message describing what went wrong.
        message: String,
    },
}

impl ResultType {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultType::Success { .. })
    }
}

/// One structured event from a worker's line-delimited JSON stream.
///
/// Events are stored verbatim; the accessors only interpret the handful of
/// fields the orchestrator needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamEvent(pub Value);

impl StreamEvent {
    /// Parse one line of worker output.
    pub fn parse(line: &str) -> Result<Self> {
        Ok(Self(serde_json::from_str(line)?))
    }

    /// Build the event a worker emits when it has initialized a session.
    pub fn session_init(session_id: &str) -> Self {
        Self(serde_json::json!({
            "type": "system",
            "subtype": "init",
            "session_id": session_id,
        }))
    }

    /// Build a terminal result event.
    pub fn result(success: bool, text: &str) -> Self {
        Self(serde_json::json!({
            "type": "result",
            "subtype": if success { "success" } else { "error" },
            "is_error": !success,
            "result": text,
        }))
    }

    pub fn event_type(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn subtype(&self) -> Option<&str> {
        self.0.get("subtype").and_then(Value::as_str)
    }

    /// The session id announced by a `system`/`init` event.
    pub fn session_init_id(&self) -> Option<&str> {
        if self.event_type() != Some("system") || self.subtype() != Some("init") {
            return None;
        }
        self.0
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Interpret a terminal `result` event.
    pub fn result_outcome(&self) -> Option<ResultType> {
        if self.event_type() != Some("result") {
            return None;
        }
        let text = self
            .0
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let flagged = self
            .0
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let error_subtype = self
            .subtype()
            .map(|s| s.starts_with("error"))
            .unwrap_or(false);

        if flagged || error_subtype {
            let message = self
                .0
                .get("error")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or(text);
            Some(ResultType::Error { message })
        } else {
            Some(ResultType::Success { output: text })
        }
    }
}

/// Parameters for starting (or resuming) an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Session to resume. `None` starts a new session whose id the worker reports.
    pub session_id: Option<String>,
    /// Opaque project context; the command adapter uses it as working directory.
    pub project_context: String,
    pub input_query: String,
    pub agent_name: Option<String>,
    pub task_id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub config_refs: Vec<String>,
}

impl ExecutionParams {
    pub fn new(project_context: impl Into<String>, input_query: impl Into<String>) -> Self {
        Self {
            project_context: project_context.into(),
            input_query: input_query.into(),
            ..Default::default()
        }
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = Some(agent.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn is_resume(&self) -> bool {
        self.session_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// One worker invocation, live or historical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Empty until the worker reports its session id.
    pub session_id: String,
    pub pid: Option<u32>,
    pub status: ExecutionStatus,
    pub project_context: String,
    pub input_query: String,
    pub events: Vec<StreamEvent>,
    pub errors: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub agent_name: Option<String>,
    pub task_id: Option<String>,
    pub model: Option<String>,
    pub config_refs: Vec<String>,
}

impl Execution {
    /// Create a pending execution from its parameters.
    pub fn from_params(params: &ExecutionParams) -> Self {
        Self {
            session_id: params.session_id.clone().unwrap_or_default(),
            pid: None,
            status: ExecutionStatus::Pending,
            project_context: params.project_context.clone(),
            input_query: params.input_query.clone(),
            events: Vec::new(),
            errors: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            exit_code: None,
            agent_name: params.agent_name.clone(),
            task_id: params.task_id.clone(),
            model: params.model.clone(),
            config_refs: params.config_refs.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Move to a terminal status, stamping the end time once.
    ///
    /// A terminal execution keeps its first terminal status.
    pub fn finish(&mut self, status: ExecutionStatus) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        true
    }

    /// The outcome of the last `result` event, if the worker sent one.
    pub fn result(&self) -> Option<ResultType> {
        self.events.iter().rev().find_map(StreamEvent::result_outcome)
    }
}

/// Callback for each stream event, with the execution's session id.
pub type StreamCallback = Arc<dyn Fn(&str, &StreamEvent) + Send + Sync>;
/// Callback for each error string, with the execution's session id.
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Callback fired once when an execution reaches a terminal status.
pub type CompleteCallback = Arc<dyn Fn(&str, ExecutionStatus) + Send + Sync>;

/// Caller-supplied observers for a single execution.
#[derive(Clone, Default)]
pub struct ExecutionCallbacks {
    pub on_stream: Option<StreamCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_complete: Option<CompleteCallback>,
}

impl ExecutionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_stream(mut self, f: impl Fn(&str, &StreamEvent) + Send + Sync + 'static) -> Self {
        self.on_stream = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_complete(
        mut self,
        f: impl Fn(&str, ExecutionStatus) + Send + Sync + 'static,
    ) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for ExecutionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCallbacks")
            .field("on_stream", &self.on_stream.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}
