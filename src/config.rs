use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::{
    ExecutionConfig, HealthConfig, QueueConfig, RetentionMode, RetentionPolicy, WorkerCommand,
};
use crate::workflow::WorkflowConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub worker: WorkerSection,
    pub tasks_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionKind {
    #[default]
    Inline,
    Periodic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionSection {
    pub max_concurrent: usize,
    pub session_timeout_secs: u64,
    pub max_history_size: Option<usize>,
    pub retention: RetentionKind,
    pub retention_interval_secs: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            session_timeout_secs: 10,
            max_history_size: None,
            retention: RetentionKind::Inline,
            retention_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSection {
    pub max_concurrent: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self { max_concurrent: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowSection {
    pub max_concurrent_tasks: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub auto_start: bool,
    pub poll_interval_ms: u64,
    pub pacing_delay_ms: u64,
    /// Bound on waiting for one task's execution; `0` waits forever.
    pub execution_timeout_secs: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_retries: 3,
            retry_delay_ms: 5000,
            auto_start: false,
            poll_interval_ms: 1000,
            pacing_delay_ms: 100,
            execution_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    pub zombie_threshold_secs: u64,
    pub cleanup_threshold_secs: u64,
    pub check_interval_secs: u64,
    pub cleanup_grace_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            zombie_threshold_secs: 600,
            cleanup_threshold_secs: 1200,
            check_interval_secs: 300,
            cleanup_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WorkerSection {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn tasks_dir(&self) -> Result<PathBuf> {
        match &self.tasks_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("tasks")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.worker.command.as_deref().unwrap_or("claude")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_concurrent = config.execution.max_concurrent,
            max_concurrent_tasks = config.workflow.max_concurrent_tasks,
            command = config.effective_command(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "Creating conductor directory");
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_concurrent < 1 {
            return Err(Error::InvalidConfig(
                "execution.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.queue.max_concurrent < 1 {
            return Err(Error::InvalidConfig(
                "queue.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.queue.max_concurrent > self.execution.max_concurrent {
            return Err(Error::InvalidConfig(format!(
                "queue.max_concurrent ({}) must not exceed execution.max_concurrent ({})",
                self.queue.max_concurrent, self.execution.max_concurrent
            )));
        }
        if self.workflow.max_concurrent_tasks < 1 {
            return Err(Error::InvalidConfig(
                "workflow.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.health.cleanup_threshold_secs < self.health.zombie_threshold_secs {
            return Err(Error::InvalidConfig(
                "health.cleanup_threshold_secs must not be below zombie_threshold_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        let section = &self.execution;
        let mode = match section.retention {
            RetentionKind::Inline => RetentionMode::Inline,
            RetentionKind::Periodic => {
                RetentionMode::Periodic(Duration::from_secs(section.retention_interval_secs))
            }
        };
        ExecutionConfig {
            max_concurrent: section.max_concurrent,
            session_timeout: Duration::from_secs(section.session_timeout_secs),
            retention: RetentionPolicy {
                max_history_size: section.max_history_size,
                mode,
            },
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.queue.max_concurrent,
        }
    }

    pub fn workflow_config(&self) -> WorkflowConfig {
        let section = &self.workflow;
        WorkflowConfig {
            max_concurrent_tasks: section.max_concurrent_tasks,
            max_retries: section.max_retries,
            retry_delay: Duration::from_millis(section.retry_delay_ms),
            auto_start: section.auto_start,
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            pacing_delay: Duration::from_millis(section.pacing_delay_ms),
            execution_timeout: (section.execution_timeout_secs > 0)
                .then(|| Duration::from_secs(section.execution_timeout_secs)),
            ..WorkflowConfig::default()
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        let section = &self.health;
        HealthConfig {
            zombie_threshold: Duration::from_secs(section.zombie_threshold_secs),
            cleanup_threshold: Duration::from_secs(section.cleanup_threshold_secs),
            check_interval: Duration::from_secs(section.check_interval_secs),
            cleanup_grace: Duration::from_secs(section.cleanup_grace_secs),
        }
    }

    pub fn worker_command(&self) -> WorkerCommand {
        let mut parts = self.effective_command().split_whitespace().map(String::from);
        let program = parts.next().unwrap_or_else(|| "claude".to_string());
        let mut args: Vec<String> = parts.collect();
        args.extend(self.worker.args.iter().cloned());
        WorkerCommand {
            program,
            args,
            model: self.worker.model.clone(),
            allowed_tools: self.worker.allowed_tools.clone(),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
