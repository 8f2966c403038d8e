use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::RuntimeEnvelope;
use crate::error::{HostError, HostResult};

/// Mirrors `TaskFile.params` in `original_source/src/sos/hosts.py`: the
/// substitution dictionary plus the step-nesting stack a task was created
/// under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskParams {
    pub task_id: String,
    #[serde(default)]
    pub sos_dict: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub task_stack: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Submitted,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted
        )
    }
}

/// Mirrors `TaskFile.result` as consumed by `RemoteAgent.receive_result` in
/// `original_source/src/sos/hosts.py`, including nested subtask results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub ret_code: i32,
    #[serde(default)]
    pub output: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub shared: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub subtasks: HashMap<String, TaskResult>,
}

/// The task file store external collaborator, narrowed to the
/// `{params, runtime, status, result}` surface C3/C4/C5 actually read.
pub trait TaskStore: Send + Sync {
    fn params_and_runtime(&self, task_id: &str) -> HostResult<(TaskParams, RuntimeEnvelope)>;
    fn set_runtime(&self, task_id: &str, runtime: RuntimeEnvelope) -> HostResult<()>;
    fn status(&self, task_id: &str) -> HostResult<TaskStatus>;
    fn set_status(&self, task_id: &str, status: TaskStatus) -> HostResult<()>;
    fn result(&self, task_id: &str) -> HostResult<Option<TaskResult>>;
    fn set_result(&self, task_id: &str, result: TaskResult) -> HostResult<()>;
    /// The directory this store persists `<task_id>.*` files under, e.g.
    /// `~/.sos/tasks`. Remote staging (`spec.md` §4.4.3/§4.4.4) needs this
    /// concrete root to rsync/scp task-file siblings by id glob.
    fn tasks_dir(&self) -> PathBuf;
    /// Absolute path to the on-disk record for `task_id`, if the store is
    /// file-backed enough to expose one. Used by the same staging paths as
    /// `tasks_dir`; stores with no single-file backing may return `None`.
    fn record_path(&self, task_id: &str) -> Option<PathBuf>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TaskFileRecord {
    params: TaskParams,
    runtime: RuntimeEnvelope,
    status: Option<TaskStatus>,
    result: Option<TaskResult>,
}

/// A file-backed `TaskStore` rooted at a directory (`~/.sos/tasks` by
/// default), so this workspace is runnable and testable without a real
/// task engine plugged in.
pub struct FileTaskStore {
    root: PathBuf,
}

impl FileTaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileTaskStore { root: root.into() }
    }

    pub fn default_root() -> PathBuf {
        dirs_next_home().join(".sos").join("tasks")
    }

    fn record_file(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{task_id}.json"))
    }

    fn read(&self, task_id: &str) -> HostResult<TaskFileRecord> {
        let path = self.record_file(task_id);
        let text = fs::read_to_string(&path)
            .map_err(|e| HostError::config(task_id, format!("cannot read task file {path:?}: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| HostError::config(task_id, format!("malformed task file {path:?}: {e}")))
    }

    fn write(&self, task_id: &str, record: &TaskFileRecord) -> HostResult<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| HostError::config(task_id, format!("cannot create {:?}: {e}", self.root)))?;
        let path = self.record_file(task_id);
        let text = serde_json::to_string_pretty(record)
            .map_err(|e| HostError::config(task_id, format!("cannot serialize task file: {e}")))?;
        fs::write(&path, text)
            .map_err(|e| HostError::config(task_id, format!("cannot write task file {path:?}: {e}")))
    }

    /// Creates a task record if it doesn't already exist, for tests and for
    /// the staging entry point that has no prior task engine to defer to.
    pub fn ensure(&self, task_id: &str, params: TaskParams, runtime: RuntimeEnvelope) -> HostResult<()> {
        if self.record_file(task_id).exists() {
            return Ok(());
        }
        self.write(
            task_id,
            &TaskFileRecord {
                params,
                runtime,
                status: Some(TaskStatus::Pending),
                result: None,
            },
        )
    }
}

fn dirs_next_home() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl TaskStore for FileTaskStore {
    fn params_and_runtime(&self, task_id: &str) -> HostResult<(TaskParams, RuntimeEnvelope)> {
        let record = self.read(task_id)?;
        Ok((record.params, record.runtime))
    }

    fn set_runtime(&self, task_id: &str, runtime: RuntimeEnvelope) -> HostResult<()> {
        let mut record = self.read(task_id)?;
        record.runtime = runtime;
        self.write(task_id, &record)
    }

    fn status(&self, task_id: &str) -> HostResult<TaskStatus> {
        Ok(self.read(task_id)?.status.unwrap_or(TaskStatus::Pending))
    }

    fn set_status(&self, task_id: &str, status: TaskStatus) -> HostResult<()> {
        let mut record = self.read(task_id)?;
        record.status = Some(status);
        self.write(task_id, &record)
    }

    fn result(&self, task_id: &str) -> HostResult<Option<TaskResult>> {
        Ok(self.read(task_id)?.result)
    }

    fn set_result(&self, task_id: &str, result: TaskResult) -> HostResult<()> {
        let mut record = self.read(task_id)?;
        record.result = Some(result);
        record.status = Some(TaskStatus::Completed);
        self.write(task_id, &record)
    }

    fn tasks_dir(&self) -> PathBuf {
        self.root.clone()
    }

    fn record_path(&self, task_id: &str) -> Option<PathBuf> {
        Some(self.record_file(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_status_and_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(dir.path());
        store
            .ensure("t0", TaskParams { task_id: "t0".into(), ..Default::default() }, RuntimeEnvelope::default())
            .unwrap();

        assert_eq!(store.status("t0").unwrap(), TaskStatus::Pending);

        store.set_status("t0", TaskStatus::Running).unwrap();
        assert_eq!(store.status("t0").unwrap(), TaskStatus::Running);

        store
            .set_result(
                "t0",
                TaskResult {
                    ret_code: 0,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.status("t0").unwrap(), TaskStatus::Completed);
        assert_eq!(store.result("t0").unwrap().unwrap().ret_code, 0);
    }

    #[test]
    fn missing_task_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(dir.path());
        assert!(store.status("nope").is_err());
    }
}
