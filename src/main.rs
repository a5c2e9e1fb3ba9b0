use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use conductor::config::Config;
use conductor::core::{Task, TaskStatus};
use conductor::orchestration::{
    CommandSpawner, ExecutionManager, ExecutionQueue, HealthTracker, TaskLifecycleManager,
};
use conductor::state::JsonFileTaskStore;
use conductor::util::{blocking, truncate};
use conductor::workflow::{DefaultRouter, WorkflowEngine, WorkflowEvent};
use conductor::{Error, Result};

/// Conductor - runs a backlog of tasks through AI worker processes
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the task backlog to completion
    Run {
        /// Directory the workers run in (defaults to the current directory)
        #[arg(long)]
        project: Option<PathBuf>,
    },

    /// List tasks with their status
    Tasks,

    /// Add or update tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum TaskCommand {
    /// Add a pending task
    Add {
        id: String,
        title: String,

        /// Free text; "depends on <id>" declares a dependency
        #[arg(short = 'D', long, default_value = "")]
        description: String,

        /// Agent the task is routed to
        #[arg(short, long)]
        agent: String,
    },

    /// Change a task's status
    Status {
        id: String,
        /// pending, in_progress, completed or cancelled
        status: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = conductor::log::init_with_debug(cli.debug);
    let config = Config::load()?;

    match cli.command {
        Command::Run { project } => run_workflow(config, project),
        Command::Tasks => run_tasks(config),
        Command::Task { command } => run_task_command(config, command),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn open_lifecycle(config: &Config) -> Result<TaskLifecycleManager> {
    let store = JsonFileTaskStore::open(config.tasks_dir()?)?;
    Ok(TaskLifecycleManager::new(Arc::new(store)))
}

fn run_workflow(config: Config, project: Option<PathBuf>) -> Result<()> {
    let project = match project {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        let spawner = CommandSpawner::new(config.worker_command())?;
        let manager = ExecutionManager::new(Arc::new(spawner), config.execution_config())?;
        let _retention = manager.start_retention_timer();
        let queue = ExecutionQueue::new(manager.clone(), config.queue_config())?;
        let lifecycle = Arc::new(open_lifecycle(&config)?);

        let health = HealthTracker::new(manager.clone(), config.health_config());
        health.start_health_check(None);

        let engine = WorkflowEngine::builder(Arc::clone(&lifecycle), queue)
            .config(config.workflow_config())
            .router(DefaultRouter::new(project.display().to_string()))
            .health(health.clone())
            .build();

        let mut events = engine.subscribe_channel();
        if !engine.start().await {
            return Err(Error::WorkflowFailed("could not be started".to_string()));
        }

        let outcome = loop {
            match events.recv().await {
                Ok(event) => {
                    println!("{}", event);
                    match event {
                        WorkflowEvent::WorkflowCompleted { .. } => break Ok(()),
                        WorkflowEvent::WorkflowFailed { error } => {
                            break Err(Error::WorkflowFailed(error))
                        }
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer fell behind");
                }
                Err(RecvError::Closed) => break Ok(()),
            }
        };

        health.stop_health_check();
        manager.shutdown();

        let stats = engine.stats();
        println!("completed: {}  failed: {}", stats.completed, stats.failed);
        outcome
    })
}

fn run_tasks(config: Config) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (tasks, stats) = blocking(move || {
            let lifecycle = open_lifecycle(&config)?;
            Ok((lifecycle.list_tasks()?, lifecycle.task_stats()?))
        })
        .await?;

        if tasks.is_empty() {
            println!("No tasks.");
            return Ok(());
        }

        println!("{:<20} {:<12} {:<14} TITLE", "ID", "STATUS", "AGENT");
        for task in &tasks {
            println!(
                "{:<20} {:<12} {:<14} {}",
                truncate(&task.id, 20),
                task.status.to_string(),
                truncate(&task.assigned_agent, 14),
                truncate(&task.title, 50)
            );
        }
        println!();
        println!(
            "total: {}  pending: {}  in progress: {}  completed: {}  cancelled: {}  executable: {}",
            stats.total,
            stats.pending,
            stats.in_progress,
            stats.completed,
            stats.cancelled,
            stats.executable
        );
        Ok(())
    })
}

fn run_task_command(config: Config, command: TaskCommand) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(blocking(move || {
        let lifecycle = open_lifecycle(&config)?;
        match command {
            TaskCommand::Add {
                id,
                title,
                description,
                agent,
            } => {
                let task = lifecycle.create_task(Task::new(&id, &title, &description, &agent))?;
                println!("Added task {} ({})", task.id, task.status);
            }
            TaskCommand::Status { id, status } => {
                let status: TaskStatus = status.parse().map_err(Error::InvalidConfig)?;
                let task = lifecycle.update_status(&id, status, Some("cli"))?;
                println!("Task {} is now {}", task.id, task.status);
            }
        }
        Ok(())
    }))
}
