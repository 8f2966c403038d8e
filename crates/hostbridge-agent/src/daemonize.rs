//! Platform-specific "run this in the background, detached from us" and
//! "run this attached to a pseudo-terminal" primitives used by
//! [`crate::local::LocalAgent::run_command`].
//!
//! `spec.md` §4.3 calls for a Unix double-fork (new session, zero umask,
//! stdio redirected to `/dev/null`, then `exec`) and leaves the non-Unix
//! equivalent to "whatever the target platform offers" (`spec.md` §9 Design
//! Notes). This module is the only place in the crate that touches `nix`'s
//! process primitives directly.

use std::path::Path;

use hostbridge_core::{HostError, HostResult};

/// Spawns `cmd` (a shell command line) detached from the caller: the parent
/// returns immediately once the grandchild has started, and the grandchild
/// survives the parent's exit with no controlling terminal.
#[cfg(unix)]
pub fn spawn_detached(alias: &str, cmd: &str, workdir: Option<&Path>) -> HostResult<()> {
    use nix::sys::wait::waitpid;
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: this process has not yet spawned other threads that hold
    // locks the child could deadlock on; the only work done between fork
    // and exec is setsid/umask/dup2, all async-signal-safe.
    match unsafe { fork() }.map_err(|e| HostError::connectivity(alias, format!("fork failed: {e}")))? {
        ForkResult::Parent { child } => {
            // Reap the immediate child (the "first fork"); the grandchild
            // it spawned is reparented to init and needs no further waiting.
            let _ = waitpid(child, None);
            Ok(())
        }
        ForkResult::Child => {
            // First child: start a new session so the grandchild has no
            // controlling terminal, then fork again so the grandchild is
            // orphaned (never becomes a session leader, can't reacquire one).
            let _ = setsid();
            match unsafe { fork() } {
                Ok(ForkResult::Parent { .. }) => std::process::exit(0),
                Ok(ForkResult::Child) => {
                    exec_detached(cmd, workdir);
                    std::process::exit(127);
                }
                Err(_) => std::process::exit(1),
            }
        }
    }
}

#[cfg(unix)]
fn exec_detached(cmd: &str, workdir: Option<&Path>) {
    use std::ffi::CString;
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::umask(0);
    }
    if let Some(wd) = workdir {
        let _ = std::env::set_current_dir(wd);
    }

    if let Ok(null_r) = std::fs::File::open("/dev/null") {
        if let Ok(null_w) = std::fs::OpenOptions::new().write(true).open("/dev/null") {
            unsafe {
                libc::dup2(null_r.as_raw_fd(), 0);
                libc::dup2(null_w.as_raw_fd(), 1);
                libc::dup2(null_w.as_raw_fd(), 2);
            }
        }
    }

    let shell = CString::new("/bin/sh").unwrap();
    let flag = CString::new("-c").unwrap();
    let script = CString::new(cmd).unwrap_or_else(|_| CString::new("true").unwrap());
    let argv = [shell.as_ptr(), flag.as_ptr(), script.as_ptr(), std::ptr::null()];
    unsafe {
        libc::execv(shell.as_ptr(), argv.as_ptr());
    }
}

#[cfg(not(unix))]
pub fn spawn_detached(alias: &str, cmd: &str, workdir: Option<&Path>) -> HostResult<()> {
    use std::os::windows::process::CommandExt;
    // CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS: the documented Windows
    // substitute for the Unix double-fork (`spec.md` §9 Design Notes).
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const DETACHED_PROCESS: u32 = 0x0000_0008;

    let mut command = std::process::Command::new("cmd");
    command.arg("/C").arg(cmd);
    if let Some(wd) = workdir {
        command.current_dir(wd);
    }
    command
        .creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS)
        .spawn()
        .map_err(|e| HostError::connectivity(alias, format!("failed to spawn detached process: {e}")))?;
    Ok(())
}

/// Runs `cmd` attached to a pseudo-terminal, streaming its output to this
/// process's stdout until it exits, and returns its exit code.
pub fn run_with_pty(alias: &str, cmd: &str, workdir: Option<&Path>) -> HostResult<i32> {
    use portable_pty::{native_pty_system, CommandBuilder, PtySize};
    use std::io::{Read, Write};

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| HostError::connectivity(alias, format!("openpty failed: {e}")))?;

    let mut builder = CommandBuilder::new(shell_for_platform());
    builder.arg("-c");
    builder.arg(cmd);
    if let Some(wd) = workdir {
        builder.cwd(wd);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| HostError::connectivity(alias, format!("failed to spawn under pty: {e}")))?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| HostError::connectivity(alias, format!("failed to clone pty reader: {e}")))?;
    let stdout = std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut out = std::io::stdout();
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 {
                break;
            }
            let _ = out.write_all(&buf[..n]);
            let _ = out.flush();
        }
    });

    let status = child
        .wait()
        .map_err(|e| HostError::connectivity(alias, format!("waiting on pty child failed: {e}")))?;
    let _ = stdout.join();
    Ok(if status.success() { 0 } else { 1 })
}

fn shell_for_platform() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn spawn_detached_returns_promptly() {
        let start = std::time::Instant::now();
        spawn_detached("local", "sleep 2", None).unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }
}
