//! Agent registry: the set of agents taking part in an orchestration

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::definition::AgentDefinition;
use crate::error::{OrchestrationError, Result};

/// Registered agents in insertion order, addressable by name
#[derive(Debug, Default, Clone)]
pub struct AgentRegistry {
    agents: Vec<Arc<AgentDefinition>>,
    index: HashMap<String, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Names must be unique and non-empty.
    pub fn register(&mut self, agent: AgentDefinition) -> Result<Arc<AgentDefinition>> {
        let name = agent.name().to_string();
        if name.trim().is_empty() {
            return Err(OrchestrationError::InvalidReference { agent: name });
        }
        if self.index.contains_key(&name) {
            return Err(OrchestrationError::DuplicateAgent { agent: name });
        }

        info!(
            "AgentRegistry: registered agent '{}' with {} tools",
            name,
            agent.tools().len()
        );
        let agent = Arc::new(agent);
        self.index.insert(name, self.agents.len());
        self.agents.push(agent.clone());
        Ok(agent)
    }

    /// Build a registry from a list of agents
    pub fn from_agents(agents: impl IntoIterator<Item = AgentDefinition>) -> Result<Self> {
        let mut registry = Self::new();
        for agent in agents {
            registry.register(agent)?;
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AgentDefinition>> {
        self.index.get(name).map(|&i| &self.agents[i])
    }

    /// Look up an agent, failing with `InvalidReference` when absent
    pub fn require(&self, name: &str) -> Result<&Arc<AgentDefinition>> {
        self.get(name)
            .ok_or_else(|| OrchestrationError::InvalidReference {
                agent: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Agent names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentDefinition>> {
        self.agents.iter()
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
