//! Message shapes exchanged over the tunneled command channel between a
//! `RemoteAgent` and the on-demand `hostbridge-agentd` helper it starts over
//! SSH. The helper accepts one framed request at a time and answers with
//! exactly one framed reply; the channel is a request/reply endpoint, never
//! a stream.
//!
//! The on-the-wire framing (newline-terminated JSON) is an implementation
//! choice of this workspace, not dictated by anything upstream; what matters
//! is that `hostbridge-ssh`'s client and `hostbridge-agentd`'s server agree,
//! which the `encode`/`decode` helpers below guarantee by construction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A verb sent to the helper, one per tunneled round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Request {
    /// Health probe; the only request issued while deciding whether to
    /// reuse a cached channel or rebuild it.
    Alive,
    /// Do all of `targets` exist, relative to `cwd`?
    Exists { targets: Vec<String>, cwd: String },
    /// Compute a content signature for each of `targets`, relative to `cwd`.
    Signature { targets: Vec<String>, cwd: String },
    /// Run `cmd` remotely (optionally under `workdir`) and capture output.
    CheckOutput {
        cmd: String,
        workdir: Option<String>,
        #[serde(default)]
        kwargs: HashMap<String, serde_json::Value>,
    },
}

/// The helper's answer to a `Request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Yes,
    No,
    Error { message: String },
    Signature { hash: String },
    Output { ret_code: i32, output: String },
}

impl Response {
    pub fn is_yes(&self) -> bool {
        matches!(self, Response::Yes)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Response::Error { message } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes a value as a single newline-terminated JSON line, the unit of
/// framing both ends of the tunneled channel agree on.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, FrameError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line (without its trailing newline) back into a value.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, FrameError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_alive_request() {
        let line = encode_line(&Request::Alive).unwrap();
        assert!(line.ends_with('\n'));
        let decoded: Request = decode_line(&line).unwrap();
        matches!(decoded, Request::Alive);
    }

    #[test]
    fn round_trips_check_output_response() {
        let resp = Response::Output {
            ret_code: 0,
            output: "hello\n".to_string(),
        };
        let line = encode_line(&resp).unwrap();
        let decoded: Response = decode_line(&line).unwrap();
        match decoded {
            Response::Output { ret_code, output } => {
                assert_eq!(ret_code, 0);
                assert_eq!(output, "hello\n");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn is_yes_only_matches_yes_variant() {
        assert!(Response::Yes.is_yes());
        assert!(!Response::No.is_yes());
    }
}
