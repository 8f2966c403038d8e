//! Enriches an ad-hoc alias (`spec.md` §4.5 step 3: "not defined in hosts")
//! by consulting the user's real `~/.ssh/config` the same way `ssh` itself
//! would, before falling back to treating the alias as a bare address.
//! **[SUPPLEMENT]**: `spec.md` doesn't describe this; it's a natural
//! extension of "assuming the host name is a hostname or IP address" that
//! `original_source`'s `_get_remote_host` leaves for `ssh` to sort out at
//! connection time — here we sort it out earlier so `HostConfig.port`/
//! `pem_file` are already right.

use std::path::PathBuf;

use hostbridge_sshcfg::model::{ConfigTree, FileNode, HostEntry};

pub struct Discovered {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub pem_file: Option<PathBuf>,
}

/// Looks up `alias` as an exact `Host` pattern in the user's SSH config
/// tree, returning its `HostName`/`Port`/`IdentityFile`, if any.
pub fn discover(alias: &str) -> Option<Discovered> {
    let tree = hostbridge_sshcfg::load::load_user_config_tree().ok()?;
    let entry = find_exact(&tree, alias)?;
    Some(Discovered {
        hostname: entry.get("hostname").map(str::to_string),
        port: entry.get("port").and_then(|p| p.parse().ok()),
        pem_file: entry.get("identityfile").map(PathBuf::from),
    })
}

fn find_exact<'a>(tree: &'a ConfigTree, alias: &str) -> Option<&'a HostEntry> {
    fn walk<'a>(node: &'a FileNode, alias: &str) -> Option<&'a HostEntry> {
        for host in &node.hosts {
            if host.patterns.iter().any(|p| p == alias) {
                return Some(host);
            }
        }
        for inc in &node.includes {
            if let Some(found) = walk(inc, alias) {
                return Some(found);
            }
        }
        None
    }
    walk(&tree.root, alias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_hostname_and_port_from_a_real_ssh_config() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".ssh")).unwrap();
        std::fs::write(
            home.path().join(".ssh").join("config"),
            "Host cluster\n    HostName cluster.internal\n    Port 2222\n",
        )
        .unwrap();

        let previous = std::env::var("HOME").ok();
        std::env::set_var("HOME", home.path());
        let found = discover("cluster");
        if let Some(prev) = previous {
            std::env::set_var("HOME", prev);
        }

        let found = found.expect("alias should be discovered from the fake ~/.ssh/config");
        assert_eq!(found.hostname.as_deref(), Some("cluster.internal"));
        assert_eq!(found.port, Some(2222));
    }

    #[test]
    fn unknown_alias_discovers_nothing() {
        assert!(find_exact(
            &ConfigTree {
                root: FileNode { path: PathBuf::from("/dev/null"), hosts: vec![], includes: vec![], matches: vec![] }
            },
            "nope"
        )
        .is_none());
    }
}
