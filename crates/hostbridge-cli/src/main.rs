//! Thin front door over the Resolver/Registry/Agent stack (`spec.md` §2
//! "front door"): resolve a host, stage files to or from it, or run a
//! command on it. Everything past argument parsing is delegated straight
//! to the library crates; this binary owns no behavior of its own.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostbridge_agent::{Agent, CommandSpec};
use hostbridge_core::ConfigDocument;
use hostbridge_registry::REGISTRY;

#[derive(Parser, Debug)]
#[command(name = "hostbridge", about = "Resolve, stage to/from, and run commands on a configured host")]
struct Cli {
    /// Path to the hosts config document (YAML). Defaults to ~/.sos/config.yml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve an alias to its concrete host configuration and print it as JSON.
    Resolve { alias: String },
    /// Check whether every given target exists on the host.
    Exists {
        alias: String,
        targets: Vec<String>,
        #[arg(long, default_value = ".")]
        cwd: String,
    },
    /// Stage files to (default) or from (`--pull`) the host.
    Stage {
        alias: String,
        items: Vec<String>,
        #[arg(long)]
        pull: bool,
    },
    /// Run a command on the host.
    Run {
        alias: String,
        cmd: String,
        #[arg(long)]
        workdir: Option<String>,
        /// Launch detached and return immediately instead of waiting for completion.
        #[arg(long)]
        background: bool,
        /// Stream output through a pseudo-terminal as it's produced.
        #[arg(long)]
        realtime: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let doc = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Resolve { alias } => {
            let config = hostbridge_resolve::resolve(&doc, &alias)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Exists { alias, targets, cwd } => {
            let agent = REGISTRY.get(&doc, &alias, false, true).await?;
            let exists = agent.target_exists(&targets, &cwd).await?;
            println!("{exists}");
        }
        Command::Stage { alias, items, pull } => {
            let agent = REGISTRY.get(&doc, &alias, false, true).await?;
            let mapped = if pull { agent.receive_from_host(&items).await? } else { agent.send_to_host(&items).await? };
            for (from, to) in mapped {
                println!("{from} -> {to}");
            }
        }
        Command::Run { alias, cmd, workdir, background, realtime } => {
            let agent = REGISTRY.get(&doc, &alias, false, true).await?;
            let spec = CommandSpec { cmd: &cmd, workdir: workdir.as_deref() };
            let code = agent.run_command(spec, !background, realtime).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<ConfigDocument> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => dirs_next::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".sos").join("config.yml"),
    };
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config document found, using an empty one");
        return Ok(ConfigDocument::default());
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_falls_back_to_an_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let doc = load_config(Some(&dir.path().join("nope.yml"))).unwrap();
        assert!(doc.hosts.is_empty());
    }

    #[test]
    fn loads_a_real_config_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "hosts:\n  cluster:\n    address: cluster.example.org\n").unwrap();
        let doc = load_config(Some(&path)).unwrap();
        assert!(doc.hosts.contains_key("cluster"));
    }
}
