use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info};

use super::{AgentKind, AgentMeta, AgentPlugin, DetectResult};
use crate::config::AgentConfig;
use crate::error::{AgentRunnerError, Result};

type Constructor = Arc<dyn Fn() -> Box<dyn AgentPlugin> + Send + Sync>;

/// Maps agent identifiers to adapter constructors
#[derive(Clone, Default)]
pub struct AgentRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for kind in AgentKind::ALL {
            registry.register(kind.as_str(), move || kind.create_plugin());
        }
        registry
    }

    /// Add or replace an adapter constructor
    pub fn register(
        &mut self,
        id: impl Into<String>,
        constructor: impl Fn() -> Box<dyn AgentPlugin> + Send + Sync + 'static,
    ) {
        let id = id.into();
        debug!("Registering agent adapter {}", id);
        self.constructors.insert(id, Arc::new(constructor));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    /// Registered identifiers, sorted
    pub fn ids(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn metadata(&self, id: &str) -> Option<AgentMeta> {
        self.constructors
            .get(id)
            .map(|constructor| constructor().meta().clone())
    }

    /// Construct and initialize an adapter
    pub fn create(&self, id: &str, config: AgentConfig) -> Result<Arc<dyn AgentPlugin>> {
        let constructor = self
            .constructors
            .get(id)
            .ok_or_else(|| AgentRunnerError::UnknownAgent {
                agent_id: id.to_string(),
            })?;
        let mut plugin = constructor();
        plugin.initialize(config)?;
        Ok(Arc::from(plugin))
    }

    /// Probe every registered agent concurrently
    pub async fn detect_all(&self) -> Vec<(String, DetectResult)> {
        let probes = self.constructors.iter().map(|(id, constructor)| {
            let plugin = constructor();
            async move { (id.clone(), plugin.detect().await) }
        });
        let results = join_all(probes).await;
        for (id, result) in &results {
            if result.available {
                info!("Found {} {}", id, result.version.as_deref().unwrap_or("(unknown version)"));
            }
        }
        results
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
