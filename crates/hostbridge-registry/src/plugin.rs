//! Task-engine and workflow-engine plugin traits (`spec.md` §4.6, §9 "the
//! task/workflow engines are discovered via a plugin registry whose entries
//! satisfy their own interfaces"). Their submit/poll/retrieve/execute
//! surface is an external collaborator (`spec.md` §1) and out of scope here;
//! only the lifecycle hooks the Host Registry itself depends on
//! (`is_stopped`, `is_alive`, `start`) are part of this crate's contract,
//! plus the built-in background-process pair used when a host's
//! `queue_type` is absent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hostbridge_core::HostConfig;

/// Lifecycle surface the registry needs from a task engine. Everything
/// past submission (poll/retrieve) belongs to the external task/workflow
/// driver, not this core.
pub trait TaskEngine: Send + Sync {
    /// True once the engine has transitioned to a stopped state; the
    /// registry evicts and rebuilds the owning agent's cache entry.
    fn is_stopped(&self) -> bool;

    /// True once `start` has run and the engine hasn't stopped since.
    fn is_alive(&self) -> bool;

    /// Starts the engine's background work. Idempotent.
    fn start(&self);
}

/// Workflow engines carry no lifecycle hooks the registry inspects
/// directly; the trait exists so a plugin can be attached to an agent and
/// named, matching `Host._workflow_engine` in `original_source`.
pub trait WorkflowEngine: Send + Sync {}

/// Constructs a [`TaskEngine`] for a resolved host. Implementations are
/// looked up by name (the host's `queue_type`, or `"process"` when absent).
pub trait TaskEnginePlugin: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self, config: &HostConfig) -> Arc<dyn TaskEngine>;
}

pub trait WorkflowEnginePlugin: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self, config: &HostConfig) -> Arc<dyn WorkflowEngine>;
}

/// The built-in pair used when a host doesn't declare a `queue_type`
/// (`spec.md` §4.6 step 3): tasks run as background processes on the
/// agent itself rather than through a batch scheduler.
pub struct ProcessTaskEngine {
    alive: AtomicBool,
    stopped: AtomicBool,
}

impl ProcessTaskEngine {
    pub fn new() -> Self {
        ProcessTaskEngine { alive: AtomicBool::new(false), stopped: AtomicBool::new(false) }
    }

    /// Test/administrative hook: marks the engine stopped so the registry's
    /// eviction path can be exercised without waiting on a real scheduler.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl TaskEngine for ProcessTaskEngine {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn start(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }
}

pub struct ProcessTaskEnginePlugin;

impl TaskEnginePlugin for ProcessTaskEnginePlugin {
    fn name(&self) -> &str {
        "process"
    }

    fn create(&self, _config: &HostConfig) -> Arc<dyn TaskEngine> {
        Arc::new(ProcessTaskEngine::new())
    }
}

pub struct ProcessWorkflowEngine;

impl WorkflowEngine for ProcessWorkflowEngine {}

pub struct ProcessWorkflowEnginePlugin;

impl WorkflowEnginePlugin for ProcessWorkflowEnginePlugin {
    fn name(&self) -> &str {
        "process"
    }

    fn create(&self, _config: &HostConfig) -> Arc<dyn WorkflowEngine> {
        Arc::new(ProcessWorkflowEngine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_engine_starts_and_reports_alive() {
        let engine = ProcessTaskEngine::new();
        assert!(!engine.is_alive());
        engine.start();
        assert!(engine.is_alive());
        assert!(!engine.is_stopped());
    }

    #[test]
    fn stopping_an_engine_clears_alive() {
        let engine = ProcessTaskEngine::new();
        engine.start();
        engine.stop();
        assert!(engine.is_stopped());
        assert!(!engine.is_alive());
    }
}
