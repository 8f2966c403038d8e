pub mod config;
pub mod error;
pub mod task;
pub mod walltime;

pub use config::{ConfigDocument, HostConfig, HostEntry, PathMapLiteral, PemFileLiteral, RuntimeEnvelope};
pub use error::{HostError, HostResult};
pub use task::{FileTaskStore, TaskParams, TaskResult, TaskStatus, TaskStore};
pub use walltime::Walltime;
