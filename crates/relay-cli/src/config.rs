use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use relay_core::providers::{Credential, DEFAULT_AZURE_API_VERSION, ModelRouter, OpenAiProvider, mask_secret};
use relay_core::tools::orders;
use relay_core::{AgentDefinition, AgentRegistry, HandoffGraph, OrchestrationConfig};

/// Configuration shipped with the binary, used when no config file exists
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub orchestration: OrchestrationSection,
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub handoffs: Vec<HandoffConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFlavor {
    #[default]
    Azure,
    OpenAi,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub flavor: ProviderFlavor,
    /// Azure resource endpoint, or the OpenAI base URL
    #[serde(default)]
    pub endpoint: String,
    /// Model name, or the deployment name for Azure
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("flavor", &self.flavor)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &mask_secret(&self.api_key))
            .field("api_version", &self.api_version)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

fn default_api_version() -> String {
    DEFAULT_AZURE_API_VERSION.to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_retry_delay_ms() -> u64 {
    500
}
fn default_max_retry_delay_ms() -> u64 {
    8000
}
fn default_request_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSection {
    pub entry_agent: String,
    #[serde(default = "default_task")]
    pub task: String,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_max_handoffs_without_user")]
    pub max_handoffs_without_user: usize,
    #[serde(default)]
    pub human_input_timeout_secs: Option<u64>,
}

fn default_task() -> String {
    "Greet the customer who is reaching out for support.".to_string()
}
fn default_max_tool_iterations() -> usize {
    10
}
fn default_max_handoffs_without_user() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instructions: String,
    #[serde(default)]
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    pub source: String,
    pub target: String,
    pub description: String,
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relay")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl RelayConfig {
    /// Load from `custom_path`, else `~/.relay/config.toml`, else the
    /// embedded default
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = match custom_path {
            Some(path) => path.clone(),
            None => {
                let path = default_config_path();
                if !path.exists() {
                    debug!("No config at {}, using embedded default", path.display());
                    return Self::parse(DEFAULT_CONFIG, env_lookup)
                        .context("Failed to parse embedded default config");
                }
                path
            }
        };
        Self::load_file(&path, env_lookup)
    }

    fn load_file(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Config may hold an API key
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    warn!(
                        "Config file {} is readable by other users ({:o}). Fix with: chmod 600 {}",
                        path.display(),
                        mode & 0o777,
                        path.display()
                    );
                }
            }
        }

        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `relay init` to create one.",
                path.display()
            )
        })?;

        Self::parse(&content, lookup)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    /// Parse TOML after expanding `${VAR}` references through `lookup`
    pub fn parse(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let expanded = expand_env_vars(content, lookup);
        let config: Self = toml::from_str(&expanded)?;

        if config.provider.flavor == ProviderFlavor::OpenAi
            && config.provider.api_key.starts_with("sk-")
        {
            warn!(
                "API key is hardcoded in config file. For security, use environment variables: api_key = \"${{OPENAI_API_KEY}}\""
            );
        }
        Ok(config)
    }

    /// Check the settings needed to reach the model endpoint
    pub fn check_provider(&self) -> Result<()> {
        let p = &self.provider;
        if p.model.trim().is_empty() {
            bail!("provider.model is empty. Set AZURE_AI_AGENT_MODEL_DEPLOYMENT_NAME or edit the config.");
        }
        match p.flavor {
            ProviderFlavor::Azure => {
                if p.endpoint.trim().is_empty() {
                    bail!("provider.endpoint is empty. Set AZURE_AI_AGENT_ENDPOINT or edit the config.");
                }
                if p.api_key.is_empty() {
                    bail!("provider.api_key is empty. Set AZURE_OPENAI_API_KEY or edit the config.");
                }
            }
            ProviderFlavor::OpenAi => {
                if p.api_key.is_empty() && p.endpoint.trim().is_empty() {
                    bail!("provider.api_key is empty. Set OPENAI_API_KEY or edit the config.");
                }
            }
        }
        Ok(())
    }

    /// Chat-completions client wrapped in a retrying router
    pub fn build_router(&self) -> Result<ModelRouter> {
        self.check_provider()?;
        let p = &self.provider;
        let provider = match p.flavor {
            ProviderFlavor::Azure => OpenAiProvider::azure(
                Credential::ApiKey(p.api_key.clone()),
                p.endpoint.clone(),
                p.model.clone(),
                p.api_version.clone(),
                p.max_tokens,
            )?,
            ProviderFlavor::OpenAi => {
                let credential = if p.api_key.is_empty() {
                    Credential::None
                } else {
                    Credential::Bearer(p.api_key.clone())
                };
                let base_url = if p.endpoint.trim().is_empty() {
                    "https://api.openai.com".to_string()
                } else {
                    p.endpoint.clone()
                };
                OpenAiProvider::new(credential, p.model.clone(), base_url, p.max_tokens)?
            }
        };

        let r = &self.runtime;
        Ok(ModelRouter::single(Box::new(provider))
            .with_max_retries(r.max_retries)
            .with_base_retry_delay(Duration::from_millis(r.base_retry_delay_ms))
            .with_max_retry_delay(Duration::from_millis(r.max_retry_delay_ms))
            .with_attempt_timeout(Duration::from_secs(r.request_timeout_secs)))
    }

    /// Agents with their plugins attached
    pub fn build_agents(&self) -> Result<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        for agent in &self.agents {
            let mut definition = AgentDefinition::new(&agent.name)
                .with_description(&agent.description)
                .with_instructions(&agent.instructions);
            for plugin_name in &agent.plugins {
                let plugin = orders::plugin_by_name(plugin_name).with_context(|| {
                    format!(
                        "Unknown plugin '{}' for agent '{}' (available: {})",
                        plugin_name,
                        agent.name,
                        orders::builtin_plugin_names().join(", ")
                    )
                })?;
                definition = definition.with_plugin(plugin);
            }
            registry.register(definition)?;
        }
        Ok(registry)
    }

    pub fn build_handoffs(&self, agents: &AgentRegistry) -> Result<HandoffGraph> {
        let mut graph = HandoffGraph::new(agents);
        for handoff in &self.handoffs {
            graph = graph.add(&handoff.source, &handoff.target, &handoff.description)?;
        }
        Ok(graph)
    }

    pub fn orchestration_config(&self) -> OrchestrationConfig {
        let o = &self.orchestration;
        OrchestrationConfig {
            max_tool_iterations: o.max_tool_iterations,
            max_handoffs_without_user: o.max_handoffs_without_user,
            human_input_timeout: o.human_input_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Allowlist of environment variable names that may be expanded in config files
const ALLOWED_ENV_VARS: &[&str] = &[
    "AZURE_AI_AGENT_ENDPOINT",
    "AZURE_AI_AGENT_MODEL_DEPLOYMENT_NAME",
    "AZURE_OPENAI_API_KEY",
    "OPENAI_API_KEY",
    "OPENAI_BASE_URL",
    "HOME",
    "USER",
];

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn expand_env_vars(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = lookup(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}
