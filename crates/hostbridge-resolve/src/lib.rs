//! The Host Resolver (`spec.md` §4.5): turns an alias plus a `ConfigDocument`
//! into a concrete, immutable [`HostConfig`] — deciding which host is local,
//! which is remote, and computing the path map and shared-path set that let
//! `hostbridge-agent::RemoteAgent` translate between the two filesystems.
//!
//! Ported from `Host._get_config`/`_get_local_host`/`_detect_host` in
//! `original_source/src/sos/hosts.py`; §4.5's numbered steps below map
//! directly onto the private helpers here.

mod mem;
mod ssh_discovery;

use std::collections::HashMap;
use std::path::PathBuf;

use hostbridge_core::{HostConfig, HostEntry, HostError, HostResult, PathMapLiteral, PemFileLiteral};

pub use mem::parse_mem_bytes;

/// Flattens each entry's `based_on` chain (`original_source/src/sos/hosts.py`'s
/// `Host._get_config` walking a host's `based_on` before applying its own
/// fields): a child's explicit fields win, `paths`/`shared` maps merge
/// key-by-key with the child's entries taking precedence on collision, and
/// any field the child leaves unset falls back to its parent's. A cycle
/// (`a based_on b based_on a`) is a `ConfigError` naming the alias it was
/// detected from.
fn resolve_based_on(hosts: &HashMap<String, HostEntry>) -> HostResult<HashMap<String, HostEntry>> {
    let mut resolved: HashMap<String, HostEntry> = HashMap::new();
    for key in hosts.keys() {
        if !resolved.contains_key(key) {
            let entry = resolve_based_on_chain(hosts, key, &mut Vec::new(), &mut resolved)?;
            resolved.insert(key.clone(), entry);
        }
    }
    Ok(resolved)
}

fn resolve_based_on_chain(
    hosts: &HashMap<String, HostEntry>,
    key: &str,
    stack: &mut Vec<String>,
    resolved: &mut HashMap<String, HostEntry>,
) -> HostResult<HostEntry> {
    if let Some(done) = resolved.get(key) {
        return Ok(done.clone());
    }
    let entry = hosts
        .get(key)
        .ok_or_else(|| HostError::config(key, format!("based_on references undefined host {key:?}")))?
        .clone();

    let Some(base_key) = entry.based_on.clone() else {
        return Ok(entry);
    };
    if stack.contains(&base_key) || base_key == key {
        return Err(HostError::config(key, format!("based_on cycle detected at {key:?} -> {base_key:?}")));
    }
    stack.push(key.to_string());
    let base = resolve_based_on_chain(hosts, &base_key, stack, resolved)?;
    stack.pop();
    resolved.insert(base_key, base.clone());

    Ok(merge_based_on(base, entry))
}

/// Merges `child` over `base`: `child`'s explicit scalar fields win, `paths`
/// and `shared` merge with `child` taking precedence per key, and `based_on`
/// itself is cleared (the chain is already flattened into this entry).
fn merge_based_on(base: HostEntry, child: HostEntry) -> HostEntry {
    let mut paths = base.paths;
    paths.extend(child.paths);
    let mut shared = base.shared;
    shared.extend(child.shared);

    HostEntry {
        address: child.address.or(base.address),
        port: child.port.or(base.port),
        pem_file: child.pem_file.or(base.pem_file),
        paths,
        shared,
        path_map: child.path_map.or(base.path_map),
        max_mem: child.max_mem.or(base.max_mem),
        max_cores: child.max_cores.or(base.max_cores),
        max_walltime: child.max_walltime.or(base.max_walltime),
        queue_type: child.queue_type.or(base.queue_type),
        status_check_interval: child.status_check_interval.or(base.status_check_interval),
        description: child.description.or(base.description),
        based_on: None,
    }
}

/// Resolves `alias` against `doc`, producing the concrete [`HostConfig`] a
/// `LocalAgent` or `RemoteAgent` will be built from.
pub fn resolve(doc: &hostbridge_core::ConfigDocument, alias: &str) -> HostResult<HostConfig> {
    let mut hosts = resolve_based_on(&doc.hosts)?;

    let detected = detect_host(&hosts);
    let mut local = local_host_key(doc, &hosts)?;
    let remote = remote_host_key(&mut hosts, alias, &local);

    if local == "localhost" && hosts.contains_key(&detected) {
        local = detected.clone();
    }

    let same_host = local == remote;
    if same_host && local != "localhost" && local != detected && !hosts.contains_key(&detected) {
        tracing::debug!(local = %local, detected = %detected, "specified host does not match detected host, cloning config");
        if let Some(local_cfg) = hosts.get(&local).cloned() {
            hosts.insert(detected.clone(), local_cfg);
        }
        local = detected.clone();
    }

    let config = if local == "localhost" && remote == "localhost" {
        HostConfig::localhost(alias_or("localhost", alias))
    } else if hosts.contains_key(&local) || hosts.contains_key(&remote) {
        let local_entry = hosts
            .get(&local)
            .ok_or_else(|| HostError::config(alias, format!("undefined local host {local:?}")))?
            .clone();
        let remote_entry = hosts
            .get(&remote)
            .ok_or_else(|| HostError::config(alias, format!("undefined remote host {remote:?}")))?
            .clone();

        let mut cfg = build_address_fields(alias, &remote, &remote_entry)?;

        let remote_is_bare_local = remote_entry.address.is_none()
            || remote_entry.address.as_deref() == Some("localhost");
        if same_host || remote_is_bare_local {
            cfg.path_map = Vec::new();
            cfg.shared = vec!["/".to_string()];
        } else {
            let (shared, mut path_map) = shared_and_path_map(&local_entry, &remote_entry);
            cfg.shared = shared;
            cfg.path_map.append(&mut path_map);
            // Explicit `path_map` literals (`spec.md` §6) on either side are
            // additional prefix translations alongside the computed
            // paths/shared intersection; `hostbridge-path` picks whichever
            // entry matches the longest prefix regardless of list order.
            if let Some(literal) = &local_entry.path_map {
                cfg.path_map.append(&mut parse_path_map_literal(alias, literal)?);
            }
            if let Some(literal) = &remote_entry.path_map {
                cfg.path_map.append(&mut parse_path_map_literal(alias, literal)?);
            }
            cfg.pem_file = select_pem_file(alias, &local_entry, &remote)?;
        }
        cfg
    } else if local == remote {
        HostConfig::localhost(alias_or(&local, alias))
    } else {
        return Err(HostError::config(
            alias,
            format!("undefined local and remote hosts {local} and {remote}"),
        ));
    };

    Ok(config)
}

fn alias_or(key: &str, alias: &str) -> String {
    if alias.is_empty() {
        key.to_string()
    } else {
        alias.to_string()
    }
}

/// `spec.md` §4.5 step 1: compare this machine's hostname and non-loopback
/// IPs against each `hosts` entry, in the same precedence order
/// `Host._detect_host` uses (hostname field, first-label hostname, alias,
/// address-after-stripping-user@, then IP).
fn detect_host(hosts: &HashMap<String, HostEntry>) -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let ips: Vec<String> = local_ip_address::list_afinet_netifas()
        .map(|ifaces| {
            ifaces
                .into_iter()
                .map(|(_, ip)| ip.to_string())
                .filter(|ip| !ip.starts_with("127."))
                .collect()
        })
        .unwrap_or_default();

    for (host, info) in hosts {
        if let Some(hn) = &info.hostname {
            let hn = hn.to_lowercase();
            if hn == hostname {
                return host.clone();
            }
            let hn_first = hn.split('.').next().unwrap_or(&hn);
            let hostname_first = hostname.split('.').next().unwrap_or(&hostname);
            if hn_first == hostname || hn == hostname_first {
                return host.clone();
            }
        }
        if host.to_lowercase() == hostname {
            return host.clone();
        }
        if let Some(addr) = &info.address {
            let stripped = addr.rsplit('@').next().unwrap_or(addr).to_lowercase();
            if stripped == hostname || stripped.split('.').next().unwrap_or(&stripped) == hostname {
                return host.clone();
            }
            if ips.iter().any(|ip| ip == &stripped) {
                return host.clone();
            }
        }
    }
    hostname.split('.').next().unwrap_or(&hostname).to_string()
}

/// `spec.md` §4.5 step 2.
fn local_host_key(
    doc: &hostbridge_core::ConfigDocument,
    hosts: &HashMap<String, HostEntry>,
) -> HostResult<String> {
    match &doc.localhost {
        Some(key) => {
            if !hosts.contains_key(key) {
                return Err(HostError::config("localhost", format!("undefined localhost {key:?}")));
            }
            Ok(key.clone())
        }
        None => Ok("localhost".to_string()),
    }
}

/// `spec.md` §4.5 step 3. Mutates `hosts` to insert an ad-hoc entry for an
/// alias that isn't a defined hosts key, mirroring `_get_remote_host`'s
/// side effect on `env.sos_dict["CONFIG"]["hosts"]`.
fn remote_host_key(hosts: &mut HashMap<String, HostEntry>, alias: &str, local: &str) -> String {
    if alias.is_empty() || alias == "localhost" {
        return local.to_string();
    }
    if hosts.contains_key(alias) {
        return alias.to_string();
    }
    tracing::debug!(alias, "assuming alias is a hostname or IP address not defined in hosts");
    let discovered = ssh_discovery::discover(alias);
    hosts.insert(
        alias.to_string(),
        HostEntry {
            address: Some(discovered.as_ref().and_then(|d| d.hostname.clone()).unwrap_or_else(|| alias.to_string())),
            port: discovered.as_ref().and_then(|d| d.port),
            pem_file: discovered.and_then(|d| d.pem_file).map(PemFileLiteral::Path),
            ..Default::default()
        },
    );
    alias.to_string()
}

fn build_address_fields(alias: &str, remote_key: &str, remote_entry: &HostEntry) -> HostResult<HostConfig> {
    let max_cores = remote_entry.max_cores;
    let max_mem = remote_entry
        .max_mem
        .as_deref()
        .map(parse_mem_bytes)
        .transpose()
        .map_err(|e| HostError::config(alias, e))?;
    let max_walltime = remote_entry
        .max_walltime
        .as_deref()
        .map(|s| s.parse::<hostbridge_core::Walltime>())
        .transpose()
        .map_err(|e| HostError::config(alias, e.to_string()))?;

    Ok(HostConfig {
        alias: alias_or(remote_key, alias),
        address: remote_entry.address.clone().unwrap_or_else(|| "localhost".to_string()),
        port: remote_entry.port.unwrap_or(22),
        pem_file: None,
        path_map: Vec::new(),
        shared: Vec::new(),
        max_mem,
        max_cores,
        max_walltime,
        queue_type: remote_entry.queue_type.clone(),
        status_check_interval: remote_entry.status_check_interval.unwrap_or(5),
        description: remote_entry.description.clone(),
        is_local: false,
    })
}

/// `spec.md` §4.5 step 5: intersect `shared` and `paths` sections of the
/// local and remote entries into the resolved `shared`/`path_map` lists.
/// Every prefix is normalized to terminate with `/`.
fn shared_and_path_map(local: &HostEntry, remote: &HostEntry) -> (Vec<String>, Vec<(String, String)>) {
    let mut shared = Vec::new();
    let mut path_map = Vec::new();

    let mut shared_keys: Vec<&String> = local.shared.keys().filter(|k| remote.shared.contains_key(*k)).collect();
    shared_keys.sort();
    for key in shared_keys {
        let l = normalize_prefix(&local.shared[key]);
        let r = normalize_prefix(&remote.shared[key]);
        shared.push(l.clone());
        path_map.push((l, r));
    }

    let missing: Vec<&String> = local.paths.keys().filter(|k| !remote.paths.contains_key(*k)).collect();
    if !missing.is_empty() {
        tracing::debug!(
            missing = ?missing,
            "one or more local paths cannot be mapped to the remote host"
        );
    }

    let mut path_keys: Vec<&String> = local.paths.keys().filter(|k| remote.paths.contains_key(*k)).collect();
    path_keys.sort();
    for key in path_keys {
        let l = normalize_prefix(&local.paths[key]);
        let r = normalize_prefix(&remote.paths[key]);
        path_map.push((l, r));
    }

    (shared, path_map)
}

/// Parses a host entry's explicit `path_map` (`spec.md` §6 "Path-map literal
/// syntax"): each list entry must contain exactly one ` -> ` separator;
/// zero or more than one is a `ConfigError` naming the offending string. The
/// `{from: to}` map form needs no such parsing — the split is already done
/// by the document's own structure.
pub fn parse_path_map_literal(alias: &str, literal: &PathMapLiteral) -> HostResult<Vec<(String, String)>> {
    match literal {
        PathMapLiteral::Map(entries) => {
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            Ok(keys
                .into_iter()
                .map(|k| (normalize_prefix(k), normalize_prefix(&entries[k])))
                .collect())
        }
        PathMapLiteral::List(lines) => lines.iter().map(|line| parse_path_map_line(alias, line)).collect(),
    }
}

fn parse_path_map_line(alias: &str, line: &str) -> HostResult<(String, String)> {
    let parts: Vec<&str> = line.split(" -> ").collect();
    match parts.as_slice() {
        [from, to] => Ok((normalize_prefix(from), normalize_prefix(to))),
        _ => Err(HostError::config(
            alias,
            format!("malformed path_map entry {line:?}: expected exactly one ' -> ' separator"),
        )),
    }
}

fn normalize_prefix(s: &str) -> String {
    if s.ends_with('/') || s.ends_with('\\') {
        s.to_string()
    } else {
        format!("{s}/")
    }
}

/// `spec.md` §4.5 step 6: `pem_file` may be a plain path (used for any
/// remote) or a `{remote_alias: path}` mapping, in which case the entry
/// keyed by `remote_key` is selected; a mapping with no entry for
/// `remote_key` is a `ConfigError` ("bad `pem_file` shape", `spec.md` §7).
fn select_pem_file(alias: &str, local: &HostEntry, remote_key: &str) -> HostResult<Option<PathBuf>> {
    match &local.pem_file {
        None => Ok(None),
        Some(PemFileLiteral::Path(p)) => Ok(Some(p.clone())),
        Some(PemFileLiteral::ByAlias(map)) => map.get(remote_key).cloned().map(Some).ok_or_else(|| {
            HostError::config(alias, format!("pem_file mapping has no entry for remote host {remote_key:?}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_core::ConfigDocument;

    fn doc(yaml: &str) -> ConfigDocument {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn s5_same_host_has_empty_path_map_and_root_shared() {
        let d = doc(
            r#"
hosts:
  a: { address: localhost }
  b: { address: localhost }
"#,
        );
        let cfg = resolve(&d, "b").unwrap();
        assert!(cfg.path_map.is_empty());
        assert_eq!(cfg.shared, vec!["/".to_string()]);
    }

    #[test]
    fn undefined_alias_becomes_ad_hoc_host() {
        let d = doc("hosts: {}\n");
        let cfg = resolve(&d, "10.0.0.5").unwrap();
        assert_eq!(cfg.address, "10.0.0.5");
        assert!(cfg.path_map.is_empty());
    }

    #[test]
    fn path_map_intersection_normalizes_separators() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
    paths:
      home: C:\work
  cluster:
    address: cluster.example.org
    paths:
      home: /work/
"#,
        );
        let cfg = resolve(&d, "cluster").unwrap();
        assert_eq!(cfg.path_map, vec![(r"C:\work/".to_string(), "/work/".to_string())]);
    }

    #[test]
    fn shared_intersection_populates_both_shared_and_path_map() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
    shared:
      scratch: /scratch
  cluster:
    address: cluster.example.org
    shared:
      scratch: /mnt/scratch
"#,
        );
        let cfg = resolve(&d, "cluster").unwrap();
        assert_eq!(cfg.shared, vec!["/scratch/".to_string()]);
        assert_eq!(cfg.path_map, vec![("/scratch/".to_string(), "/mnt/scratch/".to_string())]);
    }

    #[test]
    fn max_cores_must_be_an_integer_is_enforced_by_type() {
        let d = doc(
            r#"
hosts:
  cluster:
    address: cluster.example.org
    max_cores: 8
    max_mem: 2GB
    max_walltime: "01:00:00"
"#,
        );
        let cfg = resolve(&d, "cluster").unwrap();
        assert_eq!(cfg.max_cores, Some(8));
        assert_eq!(cfg.max_mem, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(cfg.max_walltime.unwrap().as_secs(), 3600);
    }

    #[test]
    fn explicit_path_map_literal_is_parsed_and_applied() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
  cluster:
    address: cluster.example.org
    path_map:
      - "/home/bob -> /scratch/bob"
"#,
        );
        let cfg = resolve(&d, "cluster").unwrap();
        assert_eq!(cfg.path_map, vec![("/home/bob/".to_string(), "/scratch/bob/".to_string())]);
    }

    #[test]
    fn malformed_path_map_literal_is_a_config_error_naming_the_string() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
  cluster:
    address: cluster.example.org
    path_map:
      - "/a -> /b -> /c"
"#,
        );
        let err = resolve(&d, "cluster").unwrap_err();
        assert!(err.to_string().contains("/a -> /b -> /c"));
    }

    #[test]
    fn path_map_literal_map_form_is_accepted() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
  cluster:
    address: cluster.example.org
    path_map:
      /home/bob: /scratch/bob
"#,
        );
        let cfg = resolve(&d, "cluster").unwrap();
        assert_eq!(cfg.path_map, vec![("/home/bob/".to_string(), "/scratch/bob/".to_string())]);
    }

    #[test]
    fn based_on_inherits_unset_fields_and_lets_child_override() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
  template:
    max_cores: 4
    max_mem: 1GB
    queue_type: pbs
  cluster:
    based_on: template
    address: cluster.example.org
    max_cores: 16
"#,
        );
        let cfg = resolve(&d, "cluster").unwrap();
        assert_eq!(cfg.max_cores, Some(16));
        assert_eq!(cfg.max_mem, Some(1024 * 1024 * 1024));
        assert_eq!(cfg.queue_type.as_deref(), Some("pbs"));
        assert_eq!(cfg.address, "cluster.example.org");
    }

    #[test]
    fn based_on_merges_paths_with_child_precedence() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
    paths:
      home: /home/bob
      scratch: /scratch/bob
  template:
    paths:
      scratch: /mnt/template-scratch
  cluster:
    based_on: template
    address: cluster.example.org
    paths:
      scratch: /mnt/cluster-scratch
"#,
        );
        let cfg = resolve(&d, "cluster").unwrap();
        let scratch_entry = cfg
            .path_map
            .iter()
            .find(|(local, _)| local == "/scratch/bob/")
            .expect("scratch path should be mapped");
        assert_eq!(scratch_entry.1, "/mnt/cluster-scratch/");
    }

    #[test]
    fn based_on_cycle_is_a_config_error() {
        let d = doc(
            r#"
hosts:
  a:
    based_on: b
    address: a.example.org
  b:
    based_on: a
    address: b.example.org
"#,
        );
        assert!(resolve(&d, "a").is_err());
    }

    #[test]
    fn undefined_localhost_alias_is_a_config_error() {
        let d = doc(
            r#"
localhost: nope
hosts:
  cluster: { address: cluster.example.org }
"#,
        );
        assert!(resolve(&d, "cluster").is_err());
    }

    #[test]
    fn pem_file_mapping_selects_the_remote_alias_key() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
    pem_file:
      cluster: /home/bob/.ssh/cluster.pem
      bastion: /home/bob/.ssh/bastion.pem
  cluster:
    address: cluster.example.org
"#,
        );
        let cfg = resolve(&d, "cluster").unwrap();
        assert_eq!(cfg.pem_file, Some(PathBuf::from("/home/bob/.ssh/cluster.pem")));
    }

    #[test]
    fn pem_file_mapping_missing_the_remote_alias_is_a_config_error() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
    pem_file:
      bastion: /home/bob/.ssh/bastion.pem
  cluster:
    address: cluster.example.org
"#,
        );
        let err = resolve(&d, "cluster").unwrap_err();
        assert!(err.to_string().contains("cluster"));
    }

    #[test]
    fn pem_file_plain_path_applies_to_any_remote() {
        let d = doc(
            r#"
localhost: workstation
hosts:
  workstation:
    address: localhost
    pem_file: /home/bob/.ssh/id_rsa
  cluster:
    address: cluster.example.org
"#,
        );
        let cfg = resolve(&d, "cluster").unwrap();
        assert_eq!(cfg.pem_file, Some(PathBuf::from("/home/bob/.ssh/id_rsa")));
    }
}
