//! Provider-agnostic types for LLM chat calls

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Tool definition offered to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Provider-agnostic chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: ProviderRole,
    /// Participant name, used to attribute text from other agents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: ProviderContent,
}

impl ProviderMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ProviderRole::User,
            name: None,
            content: ProviderContent::Text(text.into()),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    User,
    Assistant,
    System,
}

/// Content of a chat message, either plain text or structured blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderContent {
    Text(String),
    Blocks(Vec<ProviderBlock>),
}

/// A single block within a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProviderBlock {
    Text { text: String },
    ToolCall { id: String, name: String, input: Value },
    ToolResult { tool_call_id: String, content: String },
}

/// Provider-agnostic response from an LLM
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub blocks: Vec<ChatResponseBlock>,
    pub stop_reason: StopReason,
    pub usage: ChatUsage,
}

impl ChatResponse {
    /// Concatenated text blocks
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ChatResponseBlock::Text { text } => Some(text.as_str()),
                ChatResponseBlock::ToolCall { .. } => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ChatResponseBlock::ToolCall { .. }))
    }
}

/// A block in the response
#[derive(Debug, Clone, PartialEq)]
pub enum ChatResponseBlock {
    Text { text: String },
    ToolCall { id: String, name: String, input: Value },
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown,
}

/// Token usage from a single API call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl ChatUsage {
    pub fn add(&mut self, other: ChatUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Sending half for streamed text deltas. Remembers whether anything was
/// emitted so callers can tell a clean failure from a mid-stream one.
#[derive(Debug, Clone)]
pub struct DeltaSender {
    tx: mpsc::Sender<String>,
    emitted: Arc<AtomicBool>,
}

impl DeltaSender {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            emitted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A sender whose deltas go nowhere
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self::new(tx)
    }

    /// Forward a text delta. Returns false once the receiver is gone.
    pub async fn send(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text.is_empty() {
            return !self.tx.is_closed();
        }
        self.emitted.store(true, Ordering::SeqCst);
        self.tx.send(text).await.is_ok()
    }

    pub fn has_emitted(&self) -> bool {
        self.emitted.load(Ordering::SeqCst)
    }
}

/// Trait that all LLM providers implement
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g. "openai", "azure")
    fn provider_name(&self) -> &str;

    /// Model or deployment identifier
    fn model(&self) -> &str;

    /// Send a chat request with optional tools and system prompt
    async fn chat(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        system: &str,
    ) -> Result<ChatResponse>;

    /// Send a chat request, forwarding text deltas as they arrive. The
    /// returned response always contains the full text.
    async fn chat_stream(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        system: &str,
        deltas: &DeltaSender,
    ) -> Result<ChatResponse> {
        let response = self.chat(messages, tools, system).await?;
        deltas.send(response.text()).await;
        Ok(response)
    }
}

impl std::fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}
