//! The Host Registry (`spec.md` §4.6, §5): a process-wide alias -> agent
//! cache that instantiates the right [`Agent`] for a resolved host exactly
//! once, attaches a task-engine/workflow-engine plugin pair to it, and
//! evicts an entry whose task engine has stopped so the next lookup
//! rebuilds it. Ported from `Host._get_host_agent` in
//! `original_source/src/sos/hosts.py`.

pub mod plugin;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hostbridge_agent::{Agent, LocalAgent, RemoteAgent};
use hostbridge_core::{ConfigDocument, HostError, HostResult};
use once_cell::sync::Lazy;

pub use plugin::{
    ProcessTaskEngine, ProcessTaskEnginePlugin, ProcessWorkflowEngine, ProcessWorkflowEnginePlugin, TaskEngine,
    TaskEnginePlugin, WorkflowEngine, WorkflowEnginePlugin,
};

/// The process-wide registry, matching `Host.host_instances` in
/// `original_source` being a class-level (i.e. process-wide) dict.
pub static REGISTRY: Lazy<HostRegistry> = Lazy::new(HostRegistry::new);

struct Entry {
    agent: Arc<dyn Agent>,
    task_engine: Arc<dyn TaskEngine>,
    #[allow(dead_code)]
    workflow_engine: Arc<dyn WorkflowEngine>,
}

pub struct HostRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    task_plugins: Mutex<HashMap<String, Arc<dyn TaskEnginePlugin>>>,
    workflow_plugins: Mutex<HashMap<String, Arc<dyn WorkflowEnginePlugin>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        let registry = HostRegistry {
            entries: Mutex::new(HashMap::new()),
            task_plugins: Mutex::new(HashMap::new()),
            workflow_plugins: Mutex::new(HashMap::new()),
        };
        registry.register_task_engine_plugin(Arc::new(ProcessTaskEnginePlugin));
        registry.register_workflow_engine_plugin(Arc::new(ProcessWorkflowEnginePlugin));
        registry
    }

    pub fn register_task_engine_plugin(&self, plugin: Arc<dyn TaskEnginePlugin>) {
        self.task_plugins.lock().unwrap().insert(plugin.name().to_string(), plugin);
    }

    pub fn register_workflow_engine_plugin(&self, plugin: Arc<dyn WorkflowEnginePlugin>) {
        self.workflow_plugins.lock().unwrap().insert(plugin.name().to_string(), plugin);
    }

    /// First lookup for `alias` resolves it, builds the right agent variant,
    /// attaches plugins and caches the result; later lookups reuse the
    /// cached agent unless its task engine has stopped (`spec.md` §4.6).
    /// When `start_engine` is set and the attached engine isn't alive yet,
    /// it is started before returning.
    pub async fn get(
        &self,
        doc: &ConfigDocument,
        alias: &str,
        start_engine: bool,
        test_connection: bool,
    ) -> HostResult<Arc<dyn Agent>> {
        self.evict_dead(alias);

        if let Some(agent) = self.cached_agent(alias) {
            if start_engine {
                self.start_engine_for(alias);
            }
            return Ok(agent);
        }

        let config = hostbridge_resolve::resolve(doc, alias)?;
        let agent: Arc<dyn Agent> = if config.address == "localhost" {
            Arc::new(LocalAgent::new(config.clone()))
        } else {
            let remote = RemoteAgent::new(config.clone());
            if test_connection {
                remote.check_connectivity().await?;
            }
            Arc::new(remote)
        };

        let queue_type = config.queue_type.as_deref().unwrap_or("process");
        let task_engine = self
            .task_plugins
            .lock()
            .unwrap()
            .get(queue_type)
            .ok_or_else(|| HostError::config(alias, format!("no task engine plugin named {queue_type:?}")))?
            .create(&config);
        let workflow_engine = self
            .workflow_plugins
            .lock()
            .unwrap()
            .get(queue_type)
            .ok_or_else(|| HostError::config(alias, format!("no workflow engine plugin named {queue_type:?}")))?
            .create(&config);

        let mut entries = self.entries.lock().unwrap();
        // Another caller may have raced us to the same alias; first writer wins.
        let entry = entries.entry(alias.to_string()).or_insert_with(|| Entry { agent, task_engine, workflow_engine });
        if start_engine && !entry.task_engine.is_alive() {
            entry.task_engine.start();
        }
        Ok(entry.agent.clone())
    }

    fn cached_agent(&self, alias: &str) -> Option<Arc<dyn Agent>> {
        self.entries.lock().unwrap().get(alias).map(|e| e.agent.clone())
    }

    fn start_engine_for(&self, alias: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get(alias) {
            if !entry.task_engine.is_alive() {
                entry.task_engine.start();
            }
        }
    }

    /// Explicit eviction hook (`spec.md` §9): drops `alias`'s cache entry if
    /// its task engine has stopped, so the next [`HostRegistry::get`] call
    /// rebuilds it from scratch.
    pub fn evict_dead(&self, alias: &str) {
        let mut entries = self.entries.lock().unwrap();
        let dead = entries.get(alias).map(|e| e.task_engine.is_stopped()).unwrap_or(false);
        if dead {
            tracing::debug!(alias, "task engine stopped, evicting cached agent");
            entries.remove(alias);
        }
    }

    /// Clears every cached agent. Registered plugins survive a reset.
    pub fn reset(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_core::ConfigDocument;

    fn doc(yaml: &str) -> ConfigDocument {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn repeated_lookups_return_the_same_cached_agent() {
        let registry = HostRegistry::new();
        let d = doc("hosts: {}\n");
        let a = registry.get(&d, "localhost", false, false).await.unwrap();
        let b = registry.get(&d, "localhost", false, false).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn start_engine_starts_the_attached_task_engine() {
        let registry = HostRegistry::new();
        let d = doc("hosts: {}\n");
        registry.get(&d, "localhost", true, false).await.unwrap();
        let entries = registry.entries.lock().unwrap();
        assert!(entries.get("localhost").unwrap().task_engine.is_alive());
    }

    #[tokio::test]
    async fn a_stopped_task_engine_causes_eviction_and_rebuild() {
        let registry = HostRegistry::new();
        let d = doc("hosts: {}\n");

        let stopped_engine = ProcessTaskEngine::new();
        stopped_engine.start();
        stopped_engine.stop();
        let dummy_agent: Arc<dyn Agent> =
            Arc::new(LocalAgent::new(hostbridge_core::HostConfig::localhost("localhost")));
        registry.entries.lock().unwrap().insert(
            "localhost".to_string(),
            Entry {
                agent: dummy_agent.clone(),
                task_engine: Arc::new(stopped_engine),
                workflow_engine: Arc::new(ProcessWorkflowEngine),
            },
        );

        let rebuilt = registry.get(&d, "localhost", false, false).await.unwrap();
        assert!(!Arc::ptr_eq(&dummy_agent, &rebuilt));
    }

    #[test]
    fn reset_clears_cached_entries_but_keeps_plugins() {
        let registry = HostRegistry::new();
        registry.entries.lock().unwrap().insert(
            "dummy".to_string(),
            Entry {
                agent: Arc::new(LocalAgent::new(hostbridge_core::HostConfig::localhost("dummy"))),
                task_engine: Arc::new(ProcessTaskEngine::new()),
                workflow_engine: Arc::new(ProcessWorkflowEngine),
            },
        );
        registry.reset();
        assert!(registry.entries.lock().unwrap().is_empty());
        assert!(registry.task_plugins.lock().unwrap().contains_key("process"));
    }
}
