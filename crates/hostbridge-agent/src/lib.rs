//! The capability set shared by [`local::LocalAgent`] and [`remote::RemoteAgent`]
//! (`spec.md` §9 Design Notes): a single `Agent` trait, no inheritance
//! simulation, dispatched dynamically by `hostbridge-registry`.

pub mod daemonize;
pub mod local;
pub mod remote;

use std::collections::HashMap;

use async_trait::async_trait;
use hostbridge_core::{HostResult, TaskResult, TaskStore};

pub use local::LocalAgent;
pub use remote::RemoteAgent;

/// One run of a user command, as requested of `run_command`/`check_output`.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec<'a> {
    pub cmd: &'a str,
    pub workdir: Option<&'a str>,
}

/// Uniform execution/staging surface for a resolved host, whether it backs a
/// process on this machine (`LocalAgent`) or one reached over SSH
/// (`RemoteAgent`). All operations are async because the remote variant is
/// network I/O bound; the local variant simply never awaits anything that
/// suspends.
#[async_trait]
pub trait Agent: Send + Sync {
    fn alias(&self) -> &str;

    /// True iff every one of `targets` (resolved relative to `cwd`) exists.
    async fn target_exists(&self, targets: &[String], cwd: &str) -> HostResult<bool>;

    /// A content signature covering all of `targets`, resolved relative to `cwd`.
    async fn target_signature(&self, targets: &[String], cwd: &str) -> HostResult<String>;

    /// Stages `items` onto this host, returning `{local: remote}` for each
    /// item that was (or didn't need to be) transferred.
    async fn send_to_host(&self, items: &[String]) -> HostResult<HashMap<String, String>>;

    /// Symmetric to [`Agent::send_to_host`]: pulls `items` back, returning
    /// `{remote: local}`.
    async fn receive_from_host(&self, items: &[String]) -> HostResult<HashMap<String, String>>;

    /// Prepares `task_id` for execution on this host: enforces resource
    /// ceilings, stages inputs as needed, and flips status to `pending`.
    /// Returns `false` (never an error) when the task's resource request
    /// exceeds the host's configured ceiling.
    async fn prepare_task(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<bool>;

    /// Runs `spec.cmd` and returns its captured stdout, decoded as UTF-8.
    async fn check_output(&self, spec: CommandSpec<'_>) -> HostResult<String>;

    /// Runs `spec.cmd` and returns whether it exited zero.
    async fn check_call(&self, spec: CommandSpec<'_>) -> HostResult<bool>;

    /// Runs `spec.cmd`, optionally waiting for completion (`wait_for_task`)
    /// and/or streaming output through a pseudo-terminal (`realtime`).
    /// Returns the process's exit code, or `0` for a successfully detached
    /// background launch.
    async fn run_command(&self, spec: CommandSpec<'_>, wait_for_task: bool, realtime: bool) -> HostResult<i32>;

    /// Reads back `task_id`'s result, reverse-mapping any remote output
    /// paths to their local equivalents.
    async fn receive_result(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<TaskResult>;

    /// Uploads `task_id`'s task file to this host's task directory. A no-op
    /// for `LocalAgent`, since the file is already there.
    async fn send_job_file(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<()>;
}

/// Shared by both agents: lines a workflow driver's own progress banner
/// prints (`^\[.*\]\s*$`-ish), which `receive_result` must not echo back to
/// the caller's stderr a second time.
pub(crate) fn is_workflow_log_line(line: &str) -> bool {
    static PATTERN: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"^\[(step|workflow|task)\b.*\]\s*$").unwrap());
    PATTERN.is_match(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_workflow_log_lines() {
        assert!(is_workflow_log_line("[step 2] running"));
        assert!(is_workflow_log_line("[task abc123]"));
        assert!(!is_workflow_log_line("plain stdout line"));
    }
}
