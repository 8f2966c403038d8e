use std::path::PathBuf;

/// Error taxonomy for the host abstraction and remote execution core.
///
/// Each variant carries enough context (alias, command text, source path) to
/// reproduce the descriptive messages callers expect when a host operation
/// fails partway through.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("configuration error for host {alias:?}: {message}")]
    Config { alias: String, message: String },

    #[error("cannot connect to host {alias:?}: {message}")]
    Connectivity { alias: String, message: String },

    #[error("failed to transfer {path} to/from host {alias:?}: {message}")]
    Transfer {
        alias: String,
        path: PathBuf,
        message: String,
    },

    #[error("host {alias:?} rejected the request: {resource} exceeds the configured ceiling ({limit})")]
    ResourceLimit {
        alias: String,
        resource: String,
        limit: String,
    },

    #[error("protocol error talking to the remote helper on {alias:?}: {message}")]
    Protocol { alias: String, message: String },

    #[error("command `{command}` on host {alias:?} failed: {message}")]
    RemoteCommand {
        alias: String,
        command: String,
        message: String,
    },
}

impl HostError {
    pub fn config(alias: impl Into<String>, message: impl Into<String>) -> Self {
        HostError::Config {
            alias: alias.into(),
            message: message.into(),
        }
    }

    pub fn connectivity(alias: impl Into<String>, message: impl Into<String>) -> Self {
        HostError::Connectivity {
            alias: alias.into(),
            message: message.into(),
        }
    }

    pub fn transfer(alias: impl Into<String>, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        HostError::Transfer {
            alias: alias.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn resource_limit(
        alias: impl Into<String>,
        resource: impl Into<String>,
        limit: impl Into<String>,
    ) -> Self {
        HostError::ResourceLimit {
            alias: alias.into(),
            resource: resource.into(),
            limit: limit.into(),
        }
    }

    pub fn protocol(alias: impl Into<String>, message: impl Into<String>) -> Self {
        HostError::Protocol {
            alias: alias.into(),
            message: message.into(),
        }
    }

    pub fn remote_command(
        alias: impl Into<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        HostError::RemoteCommand {
            alias: alias.into(),
            command: command.into(),
            message: message.into(),
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;
