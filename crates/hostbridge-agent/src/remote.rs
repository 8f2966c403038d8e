//! The Remote Agent (`spec.md` §4.4): staging plus command execution over
//! SSH, owning the tunneled request/reply socket to the on-demand remote
//! helper.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hostbridge_core::{HostConfig, HostError, HostResult, RuntimeEnvelope, TaskResult, TaskStatus, TaskStore};
use hostbridge_path::{is_shared_for_host, map_path_for_host, reverse_map_path_for_host, NamedPaths};
use hostbridge_ssh::{ensure_channel, looks_like_password_prompt, receive, send, ssh_run_capture, TunneledChannel};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{is_workflow_log_line, Agent, CommandSpec};

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RemoteAgent {
    config: HostConfig,
    named: NamedPaths,
    channel: Mutex<Option<TunneledChannel>>,
}

impl RemoteAgent {
    pub fn new(config: HostConfig) -> Self {
        RemoteAgent {
            config,
            named: NamedPaths::new(),
            channel: Mutex::new(None),
        }
    }

    pub fn with_named_paths(config: HostConfig, named: NamedPaths) -> Self {
        RemoteAgent { config, named, channel: Mutex::new(None) }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn host_string(&self) -> String {
        self.config.address.clone()
    }

    fn effective_uid() -> u32 {
        #[cfg(unix)]
        {
            unsafe { libc::getuid() }
        }
        #[cfg(not(unix))]
        {
            0
        }
    }

    /// Verifies SSH connectivity and key-based auth at construction time, as
    /// the Registry wants before it hands out a freshly-built Remote Agent.
    /// Raises `ConnectivityError` on a password prompt or outright failure.
    pub async fn check_connectivity(&self) -> HostResult<()> {
        let (code, _out, err) = ssh_run_capture(
            self.alias(),
            &self.host_string(),
            self.config.port,
            self.config.pem_file.as_deref(),
            "true",
            SSH_CONNECT_TIMEOUT,
        )
        .await?;
        if looks_like_password_prompt(&err) {
            return Err(HostError::connectivity(
                self.alias(),
                "ssh prompted for a password; configure key-based authentication for this host",
            ));
        }
        if code != 0 {
            return Err(HostError::connectivity(self.alias(), format!("ssh connectivity check failed: {err}")));
        }
        Ok(())
    }

    /// Locks the shared channel slot and makes sure it holds a live
    /// connection, reusing the cached one when it still answers `alive`.
    /// Callers do their request against the guard's contents and let it drop
    /// to release the lock, leaving the channel cached for next time.
    async fn ensure_ready(&self) -> HostResult<tokio::sync::MutexGuard<'_, Option<TunneledChannel>>> {
        let mut guard = self.channel.lock().await;
        let existing = guard.take();
        let channel = ensure_channel(
            self.alias(),
            &self.host_string(),
            self.config.port,
            self.config.pem_file.as_deref(),
            Self::effective_uid(),
            existing,
        )
        .await?;
        *guard = Some(channel);
        Ok(guard)
    }

    fn expand_glob(path: &str) -> Vec<String> {
        match glob::glob(path) {
            Ok(paths) => {
                let matched: Vec<String> = paths
                    .filter_map(|p| p.ok())
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect();
                if matched.is_empty() {
                    vec![path.to_string()]
                } else {
                    matched
                }
            }
            Err(_) => vec![path.to_string()],
        }
    }

    /// Follows symlinks transitively under `path` (if it is a directory) and
    /// returns the set of real targets they point to, per `spec.md` §4.4.2
    /// step 3.
    fn discover_symlink_targets(path: &str, out: &mut Vec<String>) {
        let mut visited = std::collections::HashSet::new();
        Self::discover_symlink_targets_inner(path, out, &mut visited);
    }

    /// `visited` guards against a symlink cycle (`a -> b -> a`): both a
    /// direct self-loop and a longer chain would otherwise recurse forever
    /// through `read_link`/`read_dir` on a `is_dir()` target that traverses
    /// back through the same link.
    fn discover_symlink_targets_inner(path: &str, out: &mut Vec<String>, visited: &mut std::collections::HashSet<String>) {
        if !visited.insert(path.to_string()) {
            return;
        }
        let p = Path::new(path);
        if let Ok(target) = std::fs::read_link(p) {
            let resolved = if target.is_absolute() {
                target
            } else {
                p.parent().unwrap_or_else(|| Path::new(".")).join(target)
            };
            let resolved_str = resolved.to_string_lossy().into_owned();
            out.push(resolved_str.clone());
            Self::discover_symlink_targets_inner(&resolved_str, out, visited);
        }
        if p.is_dir() {
            if let Ok(entries) = std::fs::read_dir(p) {
                for entry in entries.flatten() {
                    Self::discover_symlink_targets_inner(&entry.path().to_string_lossy(), out, visited);
                }
            }
        }
    }
}

#[async_trait]
impl Agent for RemoteAgent {
    fn alias(&self) -> &str {
        &self.config.alias
    }

    async fn target_exists(&self, targets: &[String], cwd: &str) -> HostResult<bool> {
        let mut guard = self.ensure_ready().await?;
        let channel = guard.as_mut().expect("ensure_ready always leaves a channel behind");
        channel.exists(targets.to_vec(), cwd.to_string(), QUERY_TIMEOUT).await
    }

    async fn target_signature(&self, targets: &[String], cwd: &str) -> HostResult<String> {
        let mut guard = self.ensure_ready().await?;
        let channel = guard.as_mut().expect("ensure_ready always leaves a channel behind");
        channel.signature(targets.to_vec(), cwd.to_string(), QUERY_TIMEOUT).await
    }

    async fn send_to_host(&self, items: &[String]) -> HostResult<HashMap<String, String>> {
        let mut expanded: Vec<String> = Vec::new();
        for item in items {
            for e in Self::expand_glob(item) {
                expanded.push(e);
            }
        }

        let mut with_symlinks = expanded.clone();
        for e in &expanded {
            Self::discover_symlink_targets(e, &mut with_symlinks);
        }
        with_symlinks.sort();
        with_symlinks.dedup();

        let mut results = HashMap::new();
        for source in with_symlinks {
            if is_shared_for_host(&source, &self.config) {
                debug!(alias = %self.alias(), source = %source, "send_to_host: shared path, skipping transfer");
                results.insert(source.clone(), source);
                continue;
            }

            let dest = map_path_for_host(&source, &self.config, &self.named);
            let source_name = source.rsplit('/').next().unwrap_or(&source);
            let dest_name = dest.rsplit('/').next().unwrap_or(&dest);
            let rename = source_name != dest_name;

            send(
                self.alias(),
                &self.host_string(),
                self.config.port,
                self.config.pem_file.as_deref(),
                &source,
                &dest,
                rename,
                SSH_CONNECT_TIMEOUT,
            )
            .await?;
            results.insert(source, dest);
        }
        Ok(results)
    }

    async fn receive_from_host(&self, items: &[String]) -> HostResult<HashMap<String, String>> {
        let mut results = HashMap::new();
        let mut sources: Vec<String> = items.to_vec();
        sources.sort();

        for source in sources {
            let dest = reverse_map_path_for_host(&source, &self.config);
            let source_name = source.rsplit('/').next().unwrap_or(&source);
            let dest_name = dest.rsplit('/').next().unwrap_or(&dest);
            let rename = source_name != dest_name;

            if is_shared_for_host(&dest, &self.config) && !rename {
                debug!(alias = %self.alias(), dest = %dest, "receive_from_host: shared path, skipping transfer");
                results.insert(source, dest);
                continue;
            }

            receive(
                self.alias(),
                &self.host_string(),
                self.config.port,
                self.config.pem_file.as_deref(),
                &source,
                &dest,
                rename,
                SSH_CONNECT_TIMEOUT,
            )
            .await?;
            results.insert(source, dest);
        }
        Ok(results)
    }

    async fn prepare_task(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<bool> {
        match self.prepare_task_inner(store, task_id).await {
            Ok(()) => Ok(true),
            Err(HostError::ResourceLimit { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn check_output(&self, spec: CommandSpec<'_>) -> HostResult<String> {
        let cmd = spec.cmd.to_string();
        let workdir = spec.workdir.map(|s| s.to_string());
        let mut guard = self.ensure_ready().await?;
        let channel = guard.as_mut().expect("ensure_ready always leaves a channel behind");
        let (ret_code, output) = channel.check_output(cmd.clone(), workdir, QUERY_TIMEOUT).await?;
        if ret_code != 0 {
            return Err(HostError::remote_command(self.alias(), cmd, format!("exited with {ret_code}")));
        }
        Ok(output)
    }

    async fn check_call(&self, spec: CommandSpec<'_>) -> HostResult<bool> {
        let cmd = spec.cmd.to_string();
        let workdir = spec.workdir.map(|s| s.to_string());
        let mut guard = self.ensure_ready().await?;
        let channel = guard.as_mut().expect("ensure_ready always leaves a channel behind");
        let (ret_code, _output) = channel.check_output(cmd, workdir, QUERY_TIMEOUT).await?;
        Ok(ret_code == 0)
    }

    async fn run_command(&self, spec: CommandSpec<'_>, wait_for_task: bool, _realtime: bool) -> HostResult<i32> {
        let script = hostbridge_ssh::cmdline::execute_script(spec.cmd, spec.workdir);
        if wait_for_task {
            let (code, _out, err) = ssh_run_capture(
                self.alias(),
                &self.host_string(),
                self.config.port,
                self.config.pem_file.as_deref(),
                &script,
                SSH_CONNECT_TIMEOUT,
            )
            .await?;
            if code != 0 {
                warn!(alias = %self.alias(), code, %err, "remote command exited non-zero");
            }
            Ok(code)
        } else {
            let background = format!("nohup sh -c {} >/dev/null 2>&1 < /dev/null & disown", hostbridge_ssh::cmdline::shell_quote(&script));
            let (code, _out, err) = ssh_run_capture(
                self.alias(),
                &self.host_string(),
                self.config.port,
                self.config.pem_file.as_deref(),
                &background,
                SSH_CONNECT_TIMEOUT,
            )
            .await?;
            if code != 0 {
                return Err(HostError::remote_command(self.alias(), spec.cmd, format!("could not launch in background: {err}")));
            }
            Ok(0)
        }
    }

    async fn receive_result(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<TaskResult> {
        self.scp_back_task_files(store, task_id).await?;

        let result = store.result(task_id)?;
        let mut result = match result {
            Some(r) => r,
            None => {
                return Ok(TaskResult {
                    ret_code: 1,
                    ..Default::default()
                })
            }
        };

        let (_params, runtime) = store.params_and_runtime(task_id)?;
        let verbose = runtime.verbosity.unwrap_or(0) >= 3;

        if result.ret_code != 0 || verbose {
            for key in ["stdout", "stderr"] {
                if let Some(text) = result.output.get(key).and_then(|v| v.as_str()) {
                    for line in text.lines() {
                        if !is_workflow_log_line(line) {
                            eprintln!("{line}");
                        }
                    }
                }
            }
        }
        if result.ret_code != 0 {
            return Ok(result);
        }

        let mut to_receive: Vec<String> = Vec::new();
        for (key, value) in result.output.clone() {
            if key != "stdout" && key != "stderr" {
                if let Some(path) = value.as_str() {
                    to_receive.push(path.to_string());
                }
            }
        }
        to_receive.extend(runtime.from_host.iter().cloned());

        if !to_receive.is_empty() {
            self.receive_from_host(&to_receive).await?;
        }

        for value in result.output.values_mut() {
            if let Some(path) = value.as_str() {
                let local = reverse_map_path_for_host(path, &self.config);
                *value = serde_json::Value::String(local);
            }
        }
        for sub in result.subtasks.values_mut() {
            for value in sub.output.values_mut() {
                if let Some(path) = value.as_str() {
                    let local = reverse_map_path_for_host(path, &self.config);
                    *value = serde_json::Value::String(local);
                }
            }
        }

        Ok(result)
    }

    async fn send_job_file(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<()> {
        let Some(local_path) = store.record_path(task_id) else {
            return Ok(());
        };
        let remote_tasks_dir = "~/.sos/tasks";
        let (code, _out, err) = ssh_run_capture(
            self.alias(),
            &self.host_string(),
            self.config.port,
            self.config.pem_file.as_deref(),
            &hostbridge_ssh::cmdline::mkdir_remote_script(remote_tasks_dir),
            SSH_CONNECT_TIMEOUT,
        )
        .await?;
        if code != 0 {
            return Err(HostError::transfer(self.alias(), &local_path, format!("remote mkdir -p {remote_tasks_dir} failed: {err}")));
        }

        let dest = format!("{}:{}/", self.host_string(), remote_tasks_dir);
        let status = Command::new("rsync")
            .arg("-a")
            .arg("--ignore-existing")
            .arg("-e")
            .arg(hostbridge_ssh::cmdline::rsync_ssh_option(self.config.port, self.config.pem_file.as_deref()))
            .arg(&local_path)
            .arg(&dest)
            .status()
            .await
            .map_err(|e| HostError::transfer(self.alias(), &local_path, format!("failed to run rsync: {e}")))?;
        if !status.success() {
            return Err(HostError::transfer(self.alias(), &local_path, format!("rsync to {dest} exited with {status}")));
        }
        Ok(())
    }
}

impl RemoteAgent {
    async fn prepare_task_inner(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<()> {
        let (params, mut runtime) = store.params_and_runtime(task_id)?;

        if let (Some(requested), Some(limit)) = (runtime.mem, self.config.max_mem) {
            if requested > limit {
                return Err(HostError::resource_limit(self.alias(), "mem", limit.to_string()));
            }
        }
        if let (Some(requested), Some(limit)) = (runtime.cores, self.config.max_cores) {
            if requested > limit {
                return Err(HostError::resource_limit(self.alias(), "cores", limit.to_string()));
            }
        }
        if let (Some(requested), Some(limit)) = (
            runtime.walltime.as_deref().and_then(|s| s.parse::<hostbridge_core::Walltime>().ok()),
            self.config.max_walltime,
        ) {
            if requested > limit {
                return Err(HostError::resource_limit(self.alias(), "walltime", limit.to_string()));
            }
        }

        let mut to_stage: Vec<String> = runtime.to_host.clone();
        to_stage.extend(sos_dict_paths(&params, "_input"));
        to_stage.extend(sos_dict_paths(&params, "_depends"));

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match &runtime.workdir {
            Some(wd) if wd.starts_with('#') => {
                debug!(alias = %self.alias(), task_id, workdir = %wd, "named workdir, trusting remote named-path registry");
            }
            Some(wd) if Path::new(wd).is_absolute() => {
                warn!(alias = %self.alias(), task_id, workdir = %wd, "absolute local workdir may not exist on the remote host");
            }
            None => {
                runtime.workdir = Some(format!("#{}", cwd.to_string_lossy()));
            }
            _ => {}
        }

        runtime.localhost = Some(serde_json::json!({
            "shared": self.config.shared,
            "path_map": self.config.path_map,
        }));

        if !to_stage.is_empty() {
            self.send_to_host(&to_stage).await?;
        }

        store.set_runtime(task_id, runtime)?;
        store.set_status(task_id, TaskStatus::Pending)?;
        self.send_job_file(store, task_id).await?;
        Ok(())
    }

    async fn scp_back_task_files(&self, store: &dyn TaskStore, task_id: &str) -> HostResult<()> {
        let local_dir = store.tasks_dir();
        std::fs::create_dir_all(&local_dir)
            .map_err(|e| HostError::transfer(self.alias(), &local_dir, format!("cannot create {local_dir:?}: {e}")))?;

        if let Ok(entries) = std::fs::read_dir(&local_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(task_id) {
                    if let Ok(meta) = entry.metadata() {
                        let mut perms = meta.permissions();
                        #[cfg(unix)]
                        {
                            use std::os::unix::fs::PermissionsExt;
                            perms.set_mode(perms.mode() | 0o200);
                        }
                        #[cfg(not(unix))]
                        {
                            perms.set_readonly(false);
                        }
                        let _ = std::fs::set_permissions(entry.path(), perms);
                    }
                }
            }
        }

        let remote_glob = format!("{}:~/.sos/tasks/{task_id}.*", self.host_string());
        let attempt = self.scp_pull(&remote_glob, &local_dir, true).await;
        if attempt.is_err() {
            self.scp_pull(&remote_glob, &local_dir, false).await?;
        }
        Ok(())
    }

    async fn scp_pull(&self, remote_glob: &str, local_dir: &Path, quiet: bool) -> HostResult<()> {
        let mut cmd = Command::new("scp");
        cmd.arg("-p");
        if let Some(pem) = &self.config.pem_file {
            cmd.arg("-i").arg(pem);
        }
        cmd.arg("-P").arg(self.config.port.to_string());
        cmd.arg(remote_glob).arg(local_dir);
        if quiet {
            cmd.arg("-q");
            cmd.stderr(std::process::Stdio::null());
        }
        let status = cmd
            .status()
            .await
            .map_err(|e| HostError::transfer(self.alias(), local_dir, format!("failed to run scp: {e}")))?;
        if !status.success() {
            return Err(HostError::transfer(self.alias(), local_dir, format!("scp from {remote_glob} exited with {status}")));
        }
        Ok(())
    }
}

/// Pulls path-shaped entries out of `params.sos_dict[key]` (the `_input`/
/// `_depends` substitution variables `original_source/src/sos/hosts.py`
/// stages before flipping a task to `pending`). The value may be a single
/// string, a list of strings, or absent/`None`/`Undetermined`-shaped (in
/// which case there is nothing to stage yet).
fn sos_dict_paths(params: &hostbridge_core::TaskParams, key: &str) -> Vec<String> {
    match params.sos_dict.get(key) {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_config() -> HostConfig {
        HostConfig {
            alias: "cluster".to_string(),
            address: "cluster.example.org".to_string(),
            port: 22,
            pem_file: None,
            path_map: vec![("/home/bob".to_string(), "/scratch/bob".to_string())],
            shared: vec!["/mnt/shared".to_string()],
            max_mem: None,
            max_cores: None,
            max_walltime: None,
            queue_type: None,
            status_check_interval: 5,
            description: None,
            is_local: false,
        }
    }

    #[tokio::test]
    async fn receive_from_host_reverse_maps_paths() {
        let agent = RemoteAgent::new(remote_config());
        let dest = reverse_map_path_for_host("/scratch/bob/out.txt", agent.config());
        assert_eq!(dest, "/home/bob/out.txt");
    }

    #[test]
    fn shared_path_is_recognized() {
        let agent = RemoteAgent::new(remote_config());
        assert!(is_shared_for_host("/mnt/shared/f", agent.config()));
    }

    #[cfg(unix)]
    #[test]
    fn discover_symlink_targets_does_not_recurse_forever_on_a_cycle() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        symlink(&b, &a).unwrap();
        symlink(&a, &b).unwrap();

        let mut out = Vec::new();
        RemoteAgent::discover_symlink_targets(a.to_str().unwrap(), &mut out);
        // Must return (not stack-overflow) and must have stopped walking the
        // cycle rather than growing the output without bound.
        assert!(out.len() <= 2);
    }
}
