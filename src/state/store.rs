//! Task persistence.
//!
//! The lifecycle manager only needs keyed get/list/save, so any store will
//! do. Two are provided: an in-memory map and a directory of JSON files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::Task;
use crate::error::{Error, Result};

/// Durable task records keyed by task id.
pub trait TaskStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Task>>;

    /// All tasks, oldest first.
    fn list(&self) -> Result<Vec<Task>>;

    /// Insert or replace a task.
    fn save(&self, task: &Task) -> Result<()>;
}

/// Volatile store for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::new();
        {
            let mut map = store.tasks.lock().unwrap_or_else(|e| e.into_inner());
            for task in tasks {
                map.insert(task.id.clone(), task);
            }
        }
        store
    }
}

impl TaskStore for MemoryTaskStore {
    fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    fn list(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn save(&self, task: &Task) -> Result<()> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), task.clone());
        Ok(())
    }
}

/// One pretty-printed JSON document per task, `<dir>/<id>.json`.
///
/// Writes go through a temp file and a rename, so a crash never leaves a
/// half-written task behind.
#[derive(Debug, Clone)]
pub struct JsonFileTaskStore {
    dir: PathBuf,
}

impl JsonFileTaskStore {
    /// Open (creating if needed) a task directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        tracing::debug!(dir = %dir.display(), "Task store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("task id not usable as a file name: {:?}", id),
            )));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

impl TaskStore for JsonFileTaskStore {
    fn get(&self, id: &str) -> Result<Option<Task>> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn list(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|contents| serde_json::from_str::<Task>(&contents).map_err(Error::from));
            match parsed {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable task file")
                }
            }
        }
        tasks.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn save(&self, task: &Task) -> Result<()> {
        let path = self.path_for(&task.id)?;
        let temp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(task)?;
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}
