//! Process execution for the command templates in [`crate::cmdline`]:
//! running `ssh`, `rsync`, and `scp` as child processes and capturing their
//! exit status and output, the way a debug-heavy remote-execution client
//! always should.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use hostbridge_core::{HostError, HostResult};
use tokio::process::Command;
use tracing::debug;

use crate::cmdline::{base_ssh_args, mkdir_remote_script, rename_remote_script, rsync_ssh_option};

/// Runs `script` on `host` over `ssh -T` and captures its exit code, stdout,
/// and stderr.
pub async fn ssh_run_capture(
    alias: &str,
    host: &str,
    port: u16,
    pem_file: Option<&Path>,
    script: &str,
    timeout: Duration,
) -> HostResult<(i32, String, String)> {
    let started = std::time::Instant::now();
    let mut cmd = Command::new("ssh");
    cmd.arg("-o")
        .arg("BatchMode=yes")
        .arg("-o")
        .arg("StrictHostKeyChecking=accept-new")
        .arg("-o")
        .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
        .args(base_ssh_args(port, pem_file))
        .arg("-T")
        .arg(host)
        .arg("--")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let out = cmd
        .output()
        .await
        .map_err(|e| HostError::connectivity(alias, format!("failed to run ssh: {e}")))?;

    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    let code = out.status.code().unwrap_or(-1);

    debug!(alias, host, elapsed = ?started.elapsed(), code, "ssh_run_capture");
    if !stdout.trim().is_empty() {
        debug!(alias, "ssh_run_capture stdout: {}", stdout.trim());
    }
    if !stderr.trim().is_empty() {
        debug!(alias, "ssh_run_capture stderr: {}", stderr.trim());
    }

    Ok((code, stdout, stderr))
}

/// Password prompts mean key-based auth isn't configured; this is a
/// non-recoverable configuration failure, not something worth retrying.
pub fn looks_like_password_prompt(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("password:") || lowered.contains("permission denied (publickey")
}

/// Stages `source` to `host:dest` via `mkdir -p` + `rsync`. When `rename` is
/// true, `dest`'s directory is created and the file is rsynced in, then
/// renamed if its remote basename differs from `dest`'s.
pub async fn send(
    alias: &str,
    host: &str,
    port: u16,
    pem_file: Option<&Path>,
    source: &str,
    dest: &str,
    rename: bool,
    timeout: Duration,
) -> HostResult<()> {
    let dest_dir = if rename {
        parent_dir(dest)
    } else {
        dest.to_string()
    };

    let (code, _out, err) =
        ssh_run_capture(alias, host, port, pem_file, &mkdir_remote_script(&dest_dir), timeout).await?;
    if code != 0 {
        return Err(HostError::transfer(alias, source, format!("remote mkdir -p {dest_dir} failed: {err}")));
    }

    let rsync_dest = format!("{host}:{dest_dir}/");
    let status = Command::new("rsync")
        .arg("-a")
        .arg("--no-g")
        .arg("-e")
        .arg(rsync_ssh_option(port, pem_file))
        .arg(source)
        .arg(&rsync_dest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .status()
        .await
        .map_err(|e| HostError::transfer(alias, source, format!("failed to run rsync: {e}")))?;
    if !status.success() {
        return Err(HostError::transfer(alias, source, format!("rsync to {rsync_dest} exited with {status}")));
    }

    if rename {
        let basename = file_name(source);
        let want_basename = file_name(dest);
        if basename != want_basename {
            let old_path = format!("{dest_dir}/{basename}");
            let (code, _out, err) =
                ssh_run_capture(alias, host, port, pem_file, &rename_remote_script(&old_path, dest), timeout).await?;
            if code != 0 {
                return Err(HostError::transfer(alias, source, format!("remote rename to {dest} failed: {err}")));
            }
        }
    }

    Ok(())
}

/// Symmetric to [`send`]: pulls `host:source` into `dest`, renaming into an
/// intermediate directory and moving locally when basenames differ.
pub async fn receive(
    alias: &str,
    host: &str,
    port: u16,
    pem_file: Option<&Path>,
    source: &str,
    dest: &str,
    rename: bool,
    timeout: Duration,
) -> HostResult<()> {
    let local_dest_dir = if rename { parent_dir(dest) } else { dest.to_string() };
    std::fs::create_dir_all(&local_dest_dir)
        .map_err(|e| HostError::transfer(alias, dest, format!("cannot create local directory {local_dest_dir}: {e}")))?;

    let rsync_source = format!("{host}:{source}");
    let target = if rename { format!("{local_dest_dir}/") } else { dest.to_string() };
    let status = Command::new("rsync")
        .arg("-a")
        .arg("--no-g")
        .arg("-e")
        .arg(rsync_ssh_option(port, pem_file))
        .arg(&rsync_source)
        .arg(&target)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .status()
        .await
        .map_err(|e| HostError::transfer(alias, source, format!("failed to run rsync: {e}")))?;
    if !status.success() {
        return Err(HostError::transfer(alias, source, format!("rsync from {rsync_source} exited with {status}")));
    }

    if rename {
        let basename = file_name(source);
        let want_basename = file_name(dest);
        if basename != want_basename {
            let old_path = format!("{local_dest_dir}/{basename}");
            std::fs::rename(&old_path, dest)
                .map_err(|e| HostError::transfer(alias, dest, format!("local rename {old_path} -> {dest} failed: {e}")))?;
        }
    }

    Ok(())
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => ".".to_string(),
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_dir_handles_nested_and_root_paths() {
        assert_eq!(parent_dir("/a/b/c"), "/a/b");
        assert_eq!(parent_dir("/c"), "/");
        assert_eq!(parent_dir("relative"), ".");
    }

    #[test]
    fn file_name_strips_directory() {
        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(file_name("solo"), "solo");
    }

    #[test]
    fn detects_password_prompt() {
        assert!(looks_like_password_prompt("user@host's password:"));
        assert!(looks_like_password_prompt("Permission denied (publickey,password)."));
        assert!(!looks_like_password_prompt("connection refused"));
    }
}
