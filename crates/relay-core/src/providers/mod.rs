//! LLM provider abstraction layer
//!
//! Providers implement the [`LlmProvider`] trait and are composed via
//! [`ModelRouter`] for retries with backoff and optional failover. The
//! chat-completions client speaks both the OpenAI and the Azure OpenAI
//! deployment URL layouts.

pub mod credentials;
pub mod openai;
pub mod router;
pub mod types;

pub use credentials::{Credential, mask_secret};
pub use openai::{ApiFlavor, DEFAULT_AZURE_API_VERSION, OpenAiProvider};
pub use router::{ModelRouter, RouteError};
pub use types::{
    ChatResponse, ChatResponseBlock, ChatUsage, DeltaSender, LlmProvider, ProviderBlock,
    ProviderContent, ProviderMessage, ProviderRole, StopReason, ToolDefinition,
};
