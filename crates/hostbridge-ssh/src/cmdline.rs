//! Builds the command-line templates described for the SSH command builder:
//! ControlMaster option strings, the send/receive/execute scripts, and the
//! quoting rules that keep them safe to hand to a remote shell.

use std::path::{Path, PathBuf};

/// Builds `-o ControlMaster=... -o ControlPath=... -o ControlPersist=10m`,
/// creating `~/.ssh/controlmasters` on first use. If the directory cannot be
/// created, multiplexing is silently unavailable to the caller but loudly
/// logged here so an operator notices repeated non-multiplexed connections.
pub fn controlmaster_args() -> Vec<String> {
    let dir = controlmaster_dir();
    match std::fs::create_dir_all(&dir) {
        Ok(()) => vec![
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}/%r@%h:%p", dir.display()),
            "-o".to_string(),
            "ControlPersist=10m".to_string(),
        ],
        Err(e) => {
            tracing::warn!(error = %e, dir = %dir.display(), "could not create ssh control-master directory, connections will not be multiplexed");
            Vec::new()
        }
    }
}

fn controlmaster_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("controlmasters")
}

/// `-i KEY`, when a pem file is configured.
pub fn pem_args(pem_file: Option<&Path>) -> Vec<String> {
    match pem_file {
        Some(p) => vec!["-i".to_string(), p.display().to_string()],
        None => Vec::new(),
    }
}

/// The full option set prefixed to every `ssh` invocation: ControlMaster
/// options, an optional identity file, and `-p PORT`.
pub fn base_ssh_args(port: u16, pem_file: Option<&Path>) -> Vec<String> {
    let mut args = controlmaster_args();
    args.extend(pem_args(pem_file));
    args.push("-p".to_string());
    args.push(port.to_string());
    args
}

/// The `-e 'ssh -p PORT ...'` argument rsync needs to reuse the same options.
pub fn rsync_ssh_option(port: u16, pem_file: Option<&Path>) -> String {
    let mut parts = vec!["ssh".to_string()];
    parts.extend(base_ssh_args(port, pem_file));
    parts.join(" ")
}

/// Single-quotes `s` for a POSIX shell, doubling embedded quotes the
/// `'\''` way.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub fn mkdir_remote_script(dest_dir: &str) -> String {
    format!("mkdir -p {}", shell_quote(dest_dir))
}

pub fn rename_remote_script(old_path: &str, new_path: &str) -> String {
    format!("mv -- {} {}", shell_quote(old_path), shell_quote(new_path))
}

/// Wraps `cmd` in `bash --login -c '...'`, optionally preceded by a
/// `[ -d WD ] || mkdir -p WD; cd WD &&` preamble when `workdir` is set.
///
/// The original heredoc form (`<<'HEREDOC!!' ... HEREDOC!!`) only works when
/// the whole `ssh ... <<'HEREDOC!!' ...` line is itself run through a local
/// shell, so the heredoc body becomes ssh's stdin. `ssh_run_capture` instead
/// passes this string as the remote command *argument* with stdin nulled, so
/// a heredoc redirection here would attach to a null command on the far end
/// and the body would never execute. The single-quote doubling in
/// `bash --login -c '...'` already protects every token, dotted or not, so
/// there is no longer a dotted-command case that needs different handling.
pub fn wrap_login_shell(cmd: &str, workdir: Option<&str>) -> String {
    let preamble = match workdir {
        Some(wd) => {
            let q = shell_quote(wd);
            format!("[ -d {q} ] || mkdir -p {q}; cd {q} && ")
        }
        None => String::new(),
    };
    let escaped = cmd.replace('\'', "'\\''");
    format!("{preamble}bash --login -c '{escaped}'")
}

/// Builds the full remote script for `execute`.
pub fn execute_script(cmd: &str, workdir: Option<&str>) -> String {
    wrap_login_shell(cmd, workdir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_script_wraps_in_login_shell() {
        let script = execute_script("ls -la", None);
        assert!(!script.starts_with("<<"));
        assert!(script.contains("bash --login -c 'ls -la'"));
    }

    #[test]
    fn execute_script_handles_dotted_commands_inline() {
        // No heredoc form: single-quote doubling already protects tokens
        // like `a.b`, and a heredoc here would never reach the remote
        // command since `ssh_run_capture` passes this string as ssh's
        // command argument, not its stdin.
        let script = execute_script("python run.py a.b", None);
        assert!(!script.starts_with("<<"));
        assert!(script.contains("bash --login -c 'python run.py a.b'"));
    }

    #[test]
    fn execute_script_includes_workdir_preamble() {
        let script = execute_script("ls", Some("/tmp/work"));
        assert!(script.contains("[ -d '/tmp/work' ] || mkdir -p '/tmp/work'; cd '/tmp/work' &&"));
    }

    #[test]
    fn shell_quote_doubles_embedded_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn base_ssh_args_includes_port() {
        let args = base_ssh_args(2222, None);
        assert!(args.iter().any(|a| a == "2222"));
        assert!(args.iter().any(|a| a == "-p"));
    }
}
