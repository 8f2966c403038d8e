//! The on-demand remote helper bootstrapped by `hostbridge-ssh::tunnel` over
//! `nohup hostbridge-agentd --port P --duration D`.
//! Listens on `127.0.0.1:P`, answers one framed `hostbridge_proto::Request`
//! per line with one `Response`, and exits once `D` seconds pass with no
//! request activity — a short-lived helper the client's next `connect_to_server`
//! restarts on demand, never a persistent daemon.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hostbridge_proto::{decode_line, encode_line, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser, Debug)]
#[command(about = "On-demand helper for the tunneled host-agent channel")]
struct Args {
    /// TCP port to listen on, reached through the client's SSH `-L` forward.
    #[arg(long)]
    port: u16,

    /// Seconds of inactivity after which the helper exits on its own.
    #[arg(long, default_value_t = 60)]
    duration: u64,
}

/// Unix epoch seconds of the last request served, checked by the idle
/// watchdog; shared between every connection handler.
struct Activity(AtomicI64);

impl Activity {
    fn new() -> Self {
        Activity(AtomicI64::new(now()))
    }

    fn touch(&self) {
        self.0.store(now(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.0.load(Ordering::Relaxed);
        Duration::from_secs((now() - last).max(0) as u64)
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let activity = Arc::new(Activity::new());

    let listener = TcpListener::bind(("127.0.0.1", args.port))
        .await
        .with_context(|| format!("binding 127.0.0.1:{}", args.port))?;
    tracing::info!(port = args.port, duration = args.duration, "hostbridge-agentd listening");

    let idle_limit = Duration::from_secs(args.duration.max(1));
    let mut idle_check = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted.context("accept failed")?;
                activity.touch();
                let activity = activity.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(socket, &activity).await {
                        tracing::debug!(%peer, error = %e, "connection ended");
                    }
                });
            }
            _ = idle_check.tick() => {
                if activity.idle_for() >= idle_limit {
                    tracing::info!("idle timeout reached, exiting");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(socket: TcpStream, activity: &Activity) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        activity.touch();
        let response = match decode_line::<Request>(&line) {
            Ok(request) => handle_request(request),
            Err(e) => Response::Error { message: format!("malformed request: {e}") },
        };
        let encoded = encode_line(&response).context("encoding response")?;
        write_half.write_all(encoded.as_bytes()).await?;
        write_half.flush().await?;
        activity.touch();
    }
    Ok(())
}

fn handle_request(request: Request) -> Response {
    match request {
        Request::Alive => Response::Yes,
        Request::Exists { targets, cwd } => exists(&targets, &cwd),
        Request::Signature { targets, cwd } => signature(&targets, &cwd),
        Request::CheckOutput { cmd, workdir, kwargs: _ } => check_output(&cmd, workdir.as_deref()),
    }
}

fn resolve(target: &str, cwd: &str) -> PathBuf {
    let p = Path::new(target);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        Path::new(cwd).join(p)
    }
}

fn exists(targets: &[String], cwd: &str) -> Response {
    let all = targets.iter().all(|t| resolve(t, cwd).exists());
    if all {
        Response::Yes
    } else {
        Response::No
    }
}

fn signature(targets: &[String], cwd: &str) -> Response {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for target in targets {
        let path = resolve(target, cwd);
        path.to_string_lossy().hash(&mut hasher);
        if let Ok(meta) = std::fs::metadata(&path) {
            meta.len().hash(&mut hasher);
            if let Ok(modified) = meta.modified() {
                if let Ok(dur) = modified.duration_since(std::time::UNIX_EPOCH) {
                    dur.as_nanos().hash(&mut hasher);
                }
            }
        } else {
            return Response::Error { message: format!("{}: no such file or directory", path.display()) };
        }
    }
    Response::Signature { hash: format!("{:016x}", hasher.finish()) }
}

fn check_output(cmd: &str, workdir: Option<&str>) -> Response {
    let mut command = std::process::Command::new("bash");
    command.arg("-c").arg(cmd);
    if let Some(wd) = workdir {
        command.current_dir(wd);
    }
    match command.output() {
        Ok(out) => {
            let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
            if !out.stderr.is_empty() {
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
            }
            Response::Output { ret_code: out.status.code().unwrap_or(-1), output: combined }
        }
        Err(e) => Response::Error { message: format!("failed to run `{cmd}`: {e}") },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_checks_every_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let cwd = dir.path().to_string_lossy().into_owned();

        assert!(matches!(exists(&["a".to_string()], &cwd), Response::Yes));
        assert!(matches!(exists(&["a".to_string(), "missing".to_string()], &cwd), Response::No));
    }

    #[test]
    fn signature_errors_on_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().to_string_lossy().into_owned();
        assert!(matches!(signature(&["nope".to_string()], &cwd), Response::Error { .. }));
    }

    #[test]
    fn check_output_captures_exit_code() {
        match check_output("exit 3", None) {
            Response::Output { ret_code, .. } => assert_eq!(ret_code, 3),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn activity_tracks_idle_duration() {
        let activity = Activity::new();
        assert!(activity.idle_for() < Duration::from_secs(2));
        activity.touch();
        assert!(activity.idle_for() < Duration::from_secs(2));
    }
}
