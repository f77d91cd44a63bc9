//! Agent definition: identity, instructions and capability set

use crate::tools::{Plugin, ToolRegistry};

/// A single LLM-backed participant in a handoff orchestration
#[derive(Debug)]
pub struct AgentDefinition {
    name: String,
    description: String,
    instructions: String,
    plugins: Vec<String>,
    tools: ToolRegistry,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            plugins: Vec::new(),
            tools: ToolRegistry::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Add every function of a plugin to this agent's capability set
    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        self.tools.register_plugin(&plugin);
        self.plugins.push(plugin.name().to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }
}
