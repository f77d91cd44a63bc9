//! relay-core - handoff orchestration for LLM-backed agents
//!
//! This crate provides:
//! - Agent definitions and a registry of participating agents
//! - A handoff graph of allowed transfers between agents
//! - The orchestrator state machine that routes a conversation between agents
//! - An in-process runtime with streaming, retries and graceful shutdown
//! - Streaming and human-input callbacks
//! - Capability plugins and the chat-completions provider layer

pub mod agents;
pub mod callbacks;
pub mod error;
pub mod handoff;
pub mod orchestrator;
pub mod providers;
pub mod runtime;
pub mod tools;
pub mod types;

// Re-export main types for convenience
pub use agents::{AgentDefinition, AgentRegistry};
pub use callbacks::{
    ConsoleStreamingSink, HumanInput, ScriptedHumanInput, SinkFactory, StdinHumanInput,
    StreamingChunk, StreamingSink, TranscriptSink,
};
pub use error::{OrchestrationError, SessionError};
pub use handoff::{COMPLETE_TASK, HandoffAction, HandoffEdge, HandoffGraph, TRANSFER_PREFIX};
pub use orchestrator::{
    HandoffOrchestration, OrchestrationConfig, OrchestrationHandle, OrchestrationResult,
};
pub use providers::{Credential, LlmProvider, ModelRouter, OpenAiProvider};
pub use runtime::InProcessRuntime;
pub use tools::{Plugin, ToolExecutor, ToolHandler, ToolRegistry};
pub use types::{AuthorRole, ChatMessage, ContentItem, ConversationState, FunctionCall, FunctionResult};
