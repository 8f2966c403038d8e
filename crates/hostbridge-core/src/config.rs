use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::walltime::Walltime;

/// A fully resolved host description, produced by `hostbridge_resolve::resolve`
/// and otherwise treated as immutable for the lifetime of the agent it backs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub alias: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub pem_file: Option<PathBuf>,
    /// Ordered local -> remote path prefixes, longest first.
    #[serde(default)]
    pub path_map: Vec<(String, String)>,
    /// Paths considered identical on both ends (no staging needed).
    #[serde(default)]
    pub shared: Vec<String>,
    pub max_mem: Option<u64>,
    pub max_cores: Option<u32>,
    pub max_walltime: Option<Walltime>,
    pub queue_type: Option<String>,
    #[serde(default = "default_status_check_interval")]
    pub status_check_interval: u64,
    pub description: Option<String>,
    #[serde(default)]
    pub is_local: bool,
}

fn default_port() -> u16 {
    22
}

fn default_status_check_interval() -> u64 {
    5
}

impl HostConfig {
    pub fn localhost(alias: impl Into<String>) -> Self {
        HostConfig {
            alias: alias.into(),
            address: "localhost".to_string(),
            port: default_port(),
            pem_file: None,
            path_map: Vec::new(),
            shared: Vec::new(),
            max_mem: None,
            max_cores: None,
            max_walltime: None,
            queue_type: None,
            status_check_interval: default_status_check_interval(),
            description: None,
            is_local: true,
        }
    }
}

/// The minimal concrete shape the resolver needs out of a hosts config
/// document. Deliberately narrower than a general-purpose config loader,
/// which remains an external collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub hosts: HashMap<String, HostEntry>,
    #[serde(default)]
    pub localhost: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostEntry {
    pub address: Option<String>,
    pub port: Option<u16>,
    /// Either a plain path (used for any remote) or a `{remote_alias: path}`
    /// mapping (`spec.md` §4.5 step 6); `hostbridge_resolve::select_pem_file`
    /// picks the remote's key out of the latter.
    pub pem_file: Option<PemFileLiteral>,
    #[serde(default)]
    pub paths: HashMap<String, String>,
    #[serde(default)]
    pub shared: HashMap<String, String>,
    /// Explicit `path_map`, as either `["from -> to", …]` or `{from: to}`
    /// (`spec.md` §6). Parsed and validated by `hostbridge_resolve`, which is
    /// where the literal's "exactly one ` -> ` separator" rule is enforced.
    #[serde(default)]
    pub path_map: Option<PathMapLiteral>,
    pub max_mem: Option<String>,
    pub max_cores: Option<u32>,
    pub max_walltime: Option<String>,
    pub queue_type: Option<String>,
    pub status_check_interval: Option<u64>,
    pub description: Option<String>,
    #[serde(default)]
    pub based_on: Option<String>,
}

/// The two shapes `spec.md` §6 allows for a host's explicit `path_map`:
/// a list of `"from -> to"` literals, or a `{from: to}` mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathMapLiteral {
    List(Vec<String>),
    Map(HashMap<String, String>),
}

/// The two shapes `spec.md` §4.5 step 6 allows for a host entry's `pem_file`:
/// a single path used for any remote, or a `{remote_alias: path}` mapping
/// for hosts that need a different key per bastion/remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PemFileLiteral {
    Path(PathBuf),
    ByAlias(HashMap<String, PathBuf>),
}

/// Mirrors the subset of SoS's `_runtime` dict this crate consumes: the
/// per-task resource request plus the staging hints used by C3/C4.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeEnvelope {
    pub verbosity: Option<u8>,
    pub sig_mode: Option<String>,
    pub run_mode: Option<String>,
    pub walltime: Option<String>,
    pub cores: Option<u32>,
    pub mem: Option<u64>,
    pub workdir: Option<String>,
    pub max_mem: Option<u64>,
    pub max_cores: Option<u32>,
    pub max_walltime: Option<String>,
    pub localhost: Option<serde_json::Value>,
    #[serde(default)]
    pub to_host: Vec<String>,
    #[serde(default)]
    pub from_host: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_document_parses_minimal_yaml() {
        let yaml = r#"
hosts:
  cluster:
    address: cluster.example.org
    paths:
      home: /home/bob
    shared:
      scratch: /scratch
    max_walltime: "02:00:00"
"#;
        let doc: ConfigDocument = serde_yaml::from_str(yaml).unwrap();
        let host = doc.hosts.get("cluster").unwrap();
        assert_eq!(host.address.as_deref(), Some("cluster.example.org"));
        assert_eq!(host.paths.get("home").unwrap(), "/home/bob");
        assert_eq!(host.max_walltime.as_deref(), Some("02:00:00"));
    }
}
