//! Translates paths between a local and a remote filesystem namespace using
//! the `path_map`/`shared` sections of a resolved `HostConfig`.
//!
//! Forward mapping (`map_path`) resolves the input against the real
//! filesystem so that case-insensitive filesystems and symlinked working
//! directories still match the configured prefix by inode identity, not by
//! string comparison. Reverse mapping (`reverse_map_path`) only ever sees
//! remote paths, which cannot be probed locally, so it is purely lexical.
//!
//! Unlike the dynamically-typed original this core is ported from, inputs
//! here are always `&str`; there is no "non-string input" case to fall
//! through, so the "unmappable inputs are returned unchanged" rule only
//! ever applies to paths with no matching `path_map` entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hostbridge_core::HostConfig;

/// `#name -> absolute path` lookups, populated from a host's named-path
/// section.
pub type NamedPaths = HashMap<String, String>;

/// Forward-maps `path` using a resolved host's `path_map`.
pub fn map_path_for_host(path: &str, host: &HostConfig, named: &NamedPaths) -> String {
    map_path(path, &host.path_map, named)
}

/// Reverse-maps `path` using a resolved host's `path_map`.
pub fn reverse_map_path_for_host(path: &str, host: &HostConfig) -> String {
    reverse_map_path(path, &host.path_map)
}

/// True iff `path` is shared with `host` and needs no staging.
pub fn is_shared_for_host(path: &str, host: &HostConfig) -> bool {
    is_shared(path, &host.shared, &host.path_map)
}

/// Forward-maps a single path through `path_map`, resolving `#name` prefixes
/// against `named` first.
pub fn map_path(path: &str, path_map: &[(String, String)], named: &NamedPaths) -> String {
    if let Some(name) = path.strip_prefix('#') {
        return match named.get(name) {
            Some(resolved) => normalize_separators(resolved),
            None => {
                tracing::debug!(name, "named path has no registry entry, returned unchanged");
                path.to_string()
            }
        };
    }

    let abs = absolutize(path);
    let abs = normalize_cwd_case(abs);

    let mut best: Option<(&str, &str)> = None;
    for (local, remote) in path_map {
        let local_normalized = normalize_separators(local.trim_end_matches(['/', '\\']));
        if prefix_matches(&abs, Path::new(&local_normalized)) {
            if best.map_or(true, |(l, _)| local.len() > l.len()) {
                best = Some((local.as_str(), remote.as_str()));
            }
        }
    }

    match best {
        Some((local, remote)) => {
            let local_norm = local.trim_end_matches('/');
            let remote_norm = remote.trim_end_matches('/');
            let abs_str = normalize_separators(&abs.to_string_lossy());
            let local_str = normalize_separators(local_norm);
            let suffix = abs_str.strip_prefix(&local_str).unwrap_or("");
            normalize_separators(&format!("{remote_norm}{suffix}"))
        }
        None => {
            tracing::debug!(path = %abs.display(), "no path_map entry matches, returned unchanged");
            normalize_separators(&abs.to_string_lossy())
        }
    }
}

/// Forward-maps a batch of paths, preserving order.
pub fn map_paths(paths: &[String], path_map: &[(String, String)], named: &NamedPaths) -> Vec<String> {
    paths.iter().map(|p| map_path(p, path_map, named)).collect()
}

/// Reverse-maps a single remote path through `path_map`, lexically: remote
/// paths need not exist on this machine.
pub fn reverse_map_path(path: &str, path_map: &[(String, String)]) -> String {
    let normalized = normalize_separators(path);

    let mut best: Option<(&str, &str)> = None;
    for (local, remote) in path_map {
        let remote_norm = normalize_separators(remote.trim_end_matches('/'));
        if normalized == remote_norm || normalized.starts_with(&format!("{remote_norm}/")) {
            if best.map_or(true, |(_, r)| remote.len() > r.len()) {
                best = Some((local.as_str(), remote.as_str()));
            }
        }
    }

    match best {
        Some((local, remote)) => {
            let remote_norm = normalize_separators(remote.trim_end_matches('/'));
            let local_norm = local.trim_end_matches('/');
            let suffix = &normalized[remote_norm.len()..];
            normalize_separators(&format!("{local_norm}{suffix}"))
        }
        None => normalized,
    }
}

pub fn reverse_map_paths(paths: &[String], path_map: &[(String, String)]) -> Vec<String> {
    paths.iter().map(|p| reverse_map_path(p, path_map)).collect()
}

/// True iff the absolute form of `path` falls under a `shared` entry and no
/// `path_map` entry also claims it (path_map takes precedence: a path that
/// needs translation is not "shared" even if it also sits under a shared
/// root).
pub fn is_shared(path: &str, shared: &[String], path_map: &[(String, String)]) -> bool {
    let abs = absolutize(path);
    let abs_str = normalize_separators(&abs.to_string_lossy());

    let under_shared = shared.iter().any(|s| {
        let s_norm = normalize_separators(s.trim_end_matches('/'));
        abs_str == s_norm || abs_str.starts_with(&format!("{s_norm}/"))
    });
    if !under_shared {
        return false;
    }

    !path_map.iter().any(|(local, _)| {
        let local_norm = normalize_separators(local.trim_end_matches('/'));
        abs_str == local_norm || abs_str.starts_with(&format!("{local_norm}/"))
    })
}

fn normalize_separators(s: &str) -> String {
    s.replace('\\', "/")
}

fn absolutize(path: &str) -> PathBuf {
    let expanded = shellexpand_home(path);
    if looks_like_windows_drive_path(&expanded) {
        // A `C:\...`-shaped path_map entry is already absolute on whichever
        // platform it names, even when this process runs on a unix host
        // that has no notion of drive letters; Path::is_absolute() would
        // say otherwise and send it through the cwd-join below, corrupting
        // it. Matching only happens lexically for these anyway (see
        // `same_entry`'s fallback), so normalize separators and stop here.
        return PathBuf::from(normalize_separators(&expanded));
    }
    let p = Path::new(expanded.as_ref());
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(p)
    }
}

/// True for `C:\...` / `C:/...`-shaped prefixes.
fn looks_like_windows_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs_next::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// If the leading component of `abs` is the current working directory by
/// inode identity (but not necessarily by string equality, which matters on
/// case-insensitive filesystems), splice in the canonical CWD string so
/// later prefix comparisons are consistent.
fn normalize_cwd_case(abs: PathBuf) -> PathBuf {
    let cwd = match std::env::current_dir() {
        Ok(c) => c,
        Err(_) => return abs,
    };
    let cwd_components: Vec<_> = cwd.components().collect();
    if cwd_components.is_empty() || cwd_components.len() > abs.components().count() {
        return abs;
    }
    let abs_components: Vec<_> = abs.components().collect();
    let leading: PathBuf = abs_components[..cwd_components.len()].iter().collect();
    if leading == cwd || !same_entry(&leading, &cwd) {
        return abs;
    }
    let rest: PathBuf = abs_components[cwd_components.len()..].iter().collect();
    cwd.join(rest)
}

/// Checks whether `local` names the same directory entry as the leading
/// `local`-length prefix of `abs`, first lexically and then (if that fails
/// and both paths exist) by inode identity.
fn prefix_matches(abs: &Path, local: &Path) -> bool {
    if abs.starts_with(local) {
        return true;
    }
    let local_depth = local.components().count();
    let abs_components: Vec<_> = abs.components().collect();
    if local_depth == 0 || local_depth > abs_components.len() {
        return false;
    }
    let candidate: PathBuf = abs_components[..local_depth].iter().collect();
    same_entry(&candidate, local)
}

#[cfg(unix)]
fn same_entry(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => a == b,
    }
}

#[cfg(not(unix))]
fn same_entry(a: &Path, b: &Path) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> Vec<(String, String)> {
        vec![
            ("/home/bob".to_string(), "/home/remote-bob".to_string()),
            ("/home/bob/project".to_string(), "/scratch/project".to_string()),
        ]
    }

    #[test]
    fn picks_longest_matching_prefix() {
        let named = NamedPaths::new();
        let mapped = map_path("/home/bob/project/data.txt", &map(), &named);
        assert_eq!(mapped, "/scratch/project/data.txt");
    }

    #[test]
    fn falls_back_to_shorter_prefix() {
        let named = NamedPaths::new();
        let mapped = map_path("/home/bob/other/data.txt", &map(), &named);
        assert_eq!(mapped, "/home/remote-bob/other/data.txt");
    }

    #[test]
    fn unmatched_path_is_unchanged_but_absolute() {
        let named = NamedPaths::new();
        let mapped = map_path("/var/log/syslog", &map(), &named);
        assert_eq!(mapped, "/var/log/syslog");
    }

    #[test]
    fn windows_style_prefix_normalizes_separators() {
        let named = NamedPaths::new();
        let win_map = vec![(r"C:\work".to_string(), "/work/".to_string())];
        let mapped = map_path(r"C:\work\x", &win_map, &named);
        assert_eq!(mapped, "/work/x");
    }

    #[test]
    fn named_path_resolves_through_registry() {
        let mut named = NamedPaths::new();
        named.insert("data".to_string(), "/scratch/data".to_string());
        let mapped = map_path("#data", &map(), &named);
        assert_eq!(mapped, "/scratch/data");
    }

    #[test]
    fn unknown_named_path_is_unchanged() {
        let named = NamedPaths::new();
        let mapped = map_path("#nope", &map(), &named);
        assert_eq!(mapped, "#nope");
    }

    #[test]
    fn reverse_map_picks_longest_remote_prefix() {
        let reversed = reverse_map_path("/scratch/project/out.txt", &map());
        assert_eq!(reversed, "/home/bob/project/out.txt");
    }

    #[test]
    fn reverse_map_unmatched_is_unchanged() {
        let reversed = reverse_map_path("/tmp/whatever", &map());
        assert_eq!(reversed, "/tmp/whatever");
    }

    #[test]
    fn shared_path_not_covered_by_path_map_is_shared() {
        let shared = vec!["/data/shared".to_string()];
        assert!(is_shared("/data/shared/input.csv", &shared, &map()));
    }

    #[test]
    fn path_map_takes_precedence_over_shared() {
        let shared = vec!["/home/bob".to_string()];
        assert!(!is_shared("/home/bob/project/input.csv", &shared, &map()));
    }

    #[test]
    fn path_outside_shared_is_not_shared() {
        let shared = vec!["/data/shared".to_string()];
        assert!(!is_shared("/tmp/scratch", &shared, &map()));
    }
}
