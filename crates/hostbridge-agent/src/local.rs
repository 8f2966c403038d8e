//! The Local Agent (`spec.md` §4.3): in-process execution, no staging, and
//! direct task-file access. Selected by `hostbridge-registry` whenever a
//! resolved host's `address` is the literal `"localhost"`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use hostbridge_core::{HostConfig, HostError, HostResult, RuntimeEnvelope, TaskResult, TaskStatus, TaskStore};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{daemonize, is_workflow_log_line, Agent, CommandSpec};

pub struct LocalAgent {
    config: HostConfig,
}

impl LocalAgent {
    pub fn new(config: HostConfig) -> Self {
        LocalAgent { config }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn resolve_target(&self, target: &str, cwd: &str) -> PathBuf {
        let p = Path::new(target);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            Path::new(cwd).join(p)
        }
    }

    fn signature_of(&self, path: &Path) -> String {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        path.to_string_lossy().hash(&mut hasher);
        if let Ok(meta) = std::fs::metadata(path) {
            meta.len().hash(&mut hasher);
            if let Ok(modified) = meta.modified() {
                if let Ok(dur) = modified.duration_since(std::time::UNIX_EPOCH) {
                    dur.as_nanos().hash(&mut hasher);
                }
            }
        }
        format!("{:016x}", hasher.finish())
    }

    /// `spec.md` §4.3 step 4: "copy the task file into `~/.sos/tasks/` if it
    /// is not already there." A `TaskStore` may root its records anywhere
    /// (tests use a tempdir); this mirrors it into the well-known global
    /// tasks directory other tooling (and `RemoteAgent::receive_result`'s
    /// scp glob) expects to find task files under.
    fn copy_into_global_tasks_dir(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<()> {
        let Some(record_path) = store.record_path(task_id) else {
            return Ok(());
        };
        let global_dir = hostbridge_core::FileTaskStore::default_root();
        if store.tasks_dir() == global_dir {
            return Ok(());
        }
        std::fs::create_dir_all(&global_dir)
            .map_err(|e| HostError::config(task_id, format!("cannot create {global_dir:?}: {e}")))?;
        let dest = global_dir.join(record_path.file_name().unwrap_or_default());
        if !dest.exists() {
            std::fs::copy(&record_path, &dest)
                .map_err(|e| HostError::config(task_id, format!("cannot copy task file to {dest:?}: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for LocalAgent {
    fn alias(&self) -> &str {
        &self.config.alias
    }

    async fn target_exists(&self, targets: &[String], cwd: &str) -> HostResult<bool> {
        Ok(targets.iter().all(|t| self.resolve_target(t, cwd).exists()))
    }

    async fn target_signature(&self, targets: &[String], cwd: &str) -> HostResult<String> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for t in targets {
            self.signature_of(&self.resolve_target(t, cwd)).hash(&mut hasher);
        }
        Ok(format!("{:016x}", hasher.finish()))
    }

    async fn send_to_host(&self, items: &[String]) -> HostResult<HashMap<String, String>> {
        Ok(items.iter().map(|x| (x.clone(), x.clone())).collect())
    }

    async fn receive_from_host(&self, items: &[String]) -> HostResult<HashMap<String, String>> {
        Ok(items.iter().map(|x| (x.clone(), x.clone())).collect())
    }

    async fn prepare_task(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<bool> {
        let (_params, mut runtime) = store.params_and_runtime(task_id)?;

        if let (Some(requested), Some(limit)) = (runtime.mem, self.config.max_mem) {
            if requested > limit {
                warn!(alias = %self.alias(), task_id, requested, limit, "task mem exceeds host ceiling");
                return Ok(false);
            }
        }
        if let (Some(requested), Some(limit)) = (runtime.cores, self.config.max_cores) {
            if requested > limit {
                warn!(alias = %self.alias(), task_id, requested, limit, "task cores exceed host ceiling");
                return Ok(false);
            }
        }
        if let (Some(requested), Some(limit)) = (
            runtime.walltime.as_deref().and_then(|s| s.parse::<hostbridge_core::Walltime>().ok()),
            self.config.max_walltime,
        ) {
            if requested > limit {
                warn!(alias = %self.alias(), task_id, "task walltime exceeds host ceiling");
                return Ok(false);
            }
        }

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let original_workdir = runtime.workdir.clone();
        if runtime.workdir.is_none() {
            runtime.workdir = Some(cwd.to_string_lossy().into_owned());
        }
        if original_workdir != runtime.workdir {
            store.set_runtime(task_id, runtime)?;
        }
        store.set_status(task_id, TaskStatus::Pending)?;
        self.copy_into_global_tasks_dir(store, task_id)?;
        debug!(alias = %self.alias(), task_id, "task prepared locally");
        Ok(true)
    }

    async fn check_output(&self, spec: CommandSpec<'_>) -> HostResult<String> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(spec.cmd);
        if let Some(wd) = spec.workdir {
            cmd.current_dir(wd);
        }
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HostError::remote_command(self.alias(), spec.cmd, format!("failed to run: {e}")))?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn check_call(&self, spec: CommandSpec<'_>) -> HostResult<bool> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(spec.cmd);
        if let Some(wd) = spec.workdir {
            cmd.current_dir(wd);
        }
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| HostError::remote_command(self.alias(), spec.cmd, format!("failed to run: {e}")))?;
        Ok(status.success())
    }

    async fn run_command(&self, spec: CommandSpec<'_>, wait_for_task: bool, realtime: bool) -> HostResult<i32> {
        let workdir = spec.workdir.map(Path::new);

        if realtime {
            let alias = self.alias().to_string();
            let cmd = spec.cmd.to_string();
            let workdir_owned = workdir.map(|p| p.to_path_buf());
            return tokio::task::spawn_blocking(move || {
                daemonize::run_with_pty(&alias, &cmd, workdir_owned.as_deref())
            })
            .await
            .map_err(|e| HostError::connectivity(self.alias(), format!("pty task panicked: {e}")))?;
        }

        if wait_for_task || cfg!(windows) {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(spec.cmd);
            if let Some(wd) = workdir {
                cmd.current_dir(wd);
            }
            let status = cmd
                .status()
                .await
                .map_err(|e| HostError::remote_command(self.alias(), spec.cmd, format!("failed to run: {e}")))?;
            return Ok(status.code().unwrap_or(-1));
        }

        let alias = self.alias().to_string();
        let cmd = spec.cmd.to_string();
        let workdir_owned = workdir.map(|p| p.to_path_buf());
        tokio::task::spawn_blocking(move || daemonize::spawn_detached(&alias, &cmd, workdir_owned.as_deref()))
            .await
            .map_err(|e| HostError::connectivity(self.alias(), format!("daemonize task panicked: {e}")))??;
        Ok(0)
    }

    async fn receive_result(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<TaskResult> {
        let result = store.result(task_id)?;
        let result = match result {
            Some(r) => r,
            None => {
                return Ok(TaskResult {
                    ret_code: 1,
                    ..Default::default()
                })
            }
        };

        let verbose = store
            .params_and_runtime(task_id)
            .map(|(_, runtime)| runtime.verbosity.unwrap_or(0) >= 3)
            .unwrap_or(false);
        if result.ret_code != 0 || verbose {
            if let Some(stdout) = result.output.get("stdout").and_then(|v| v.as_str()) {
                for line in stdout.lines() {
                    if !is_workflow_log_line(line) {
                        eprintln!("{line}");
                    }
                }
            }
            if let Some(stderr) = result.output.get("stderr").and_then(|v| v.as_str()) {
                for line in stderr.lines() {
                    if !is_workflow_log_line(line) {
                        eprintln!("{line}");
                    }
                }
            }
        }
        Ok(result)
    }

    async fn send_job_file(&self, _store: &dyn TaskStore, _task_id: &str) -> HostResult<()> {
        // The task file already lives where the local task engine expects it.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_core::{FileTaskStore, TaskParams};

    fn local_config() -> HostConfig {
        HostConfig::localhost("localhost")
    }

    #[tokio::test]
    async fn s1_echo_waits_for_exit() {
        let agent = LocalAgent::new(local_config());
        let code = agent
            .run_command(CommandSpec { cmd: "echo hi", workdir: None }, true, false)
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn s2_double_fork_returns_within_one_second() {
        let agent = LocalAgent::new(local_config());
        let start = std::time::Instant::now();
        let code = agent
            .run_command(CommandSpec { cmd: "sleep 5", workdir: None }, false, false)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn check_output_captures_stdout() {
        let agent = LocalAgent::new(local_config());
        let out = agent
            .check_output(CommandSpec { cmd: "printf hello", workdir: None })
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn prepare_task_rejects_over_budget_mem() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(dir.path());
        store
            .ensure(
                "t1",
                TaskParams { task_id: "t1".into(), ..Default::default() },
                RuntimeEnvelope { mem: Some(2_000_000_000), ..Default::default() },
            )
            .unwrap();

        let mut config = local_config();
        config.max_mem = Some(1_000_000_000);
        let agent = LocalAgent::new(config);

        assert!(!agent.prepare_task(&store, "t1").await.unwrap());
    }

    #[tokio::test]
    async fn prepare_task_accepts_within_budget() {
        // Point `~` at a scratch directory for this test: a successful
        // `prepare_task` mirrors the task file into `~/.sos/tasks`
        // (`spec.md` §4.3 step 4), and the suite must not touch the real
        // developer home directory to exercise that.
        let fake_home = tempfile::tempdir().unwrap();
        let previous_home = std::env::var_os("HOME");
        std::env::set_var("HOME", fake_home.path());

        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(dir.path());
        store
            .ensure(
                "t2",
                TaskParams { task_id: "t2".into(), ..Default::default() },
                RuntimeEnvelope { mem: Some(500), ..Default::default() },
            )
            .unwrap();

        let mut config = local_config();
        config.max_mem = Some(1_000_000_000);
        let agent = LocalAgent::new(config);

        let result = agent.prepare_task(&store, "t2").await;

        match previous_home {
            Some(home) => std::env::set_var("HOME", home),
            None => std::env::remove_var("HOME"),
        }

        assert!(result.unwrap());
        assert_eq!(store.status("t2").unwrap(), TaskStatus::Pending);
        assert!(fake_home.path().join(".sos").join("tasks").join("t2.json").exists());
    }

    #[tokio::test]
    async fn identity_staging() {
        let agent = LocalAgent::new(local_config());
        let sent = agent.send_to_host(&["/tmp/a".to_string()]).await.unwrap();
        assert_eq!(sent.get("/tmp/a").unwrap(), "/tmp/a");
    }
}
