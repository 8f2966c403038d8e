//! SSH command templates, the subprocess plumbing that executes them, and
//! the tunneled request/reply channel to the on-demand remote helper.
//!
//! This crate shells out to the system `ssh`, `rsync`, and `scp` binaries
//! and therefore inherits the user's own SSH configuration (keys, known
//! hosts, `ProxyJump`, ...). Every invocation reuses one ControlMaster
//! connection per host so repeated calls (staging, execute, tunnel bring-up)
//! pay the SSH handshake cost once.

pub mod cmdline;
pub mod run;
pub mod tunnel;

pub use run::{looks_like_password_prompt, receive, send, ssh_run_capture};
pub use tunnel::{ensure_channel, TunneledChannel};
