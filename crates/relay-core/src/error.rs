//! Orchestration error types

use std::time::Duration;

use thiserror::Error;

use crate::types::{ChatMessage, ConversationState};

/// Errors raised while configuring or running a handoff orchestration
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A handoff or entry point names an agent that is not registered
    #[error("Unknown agent referenced: '{agent}'")]
    InvalidReference { agent: String },

    /// Two agents were registered under the same name
    #[error("Agent '{agent}' is already registered")]
    DuplicateAgent { agent: String },

    /// An agent tried to transfer along an edge that is not in the graph
    #[error("Illegal handoff from '{from}' to '{to}'")]
    IllegalTransition { from: String, to: String },

    /// The model call kept failing with transient errors
    #[error("Agent '{agent}' call failed after {attempts} attempts: {message}")]
    TransientAgentCall {
        agent: String,
        attempts: u32,
        message: String,
    },

    /// The model call failed with a non-retriable error
    #[error("Agent '{agent}' call failed: {message}")]
    AgentCall { agent: String, message: String },

    #[error("No human input received within {after:?}")]
    HumanInputTimeout { after: Duration },

    #[error("Human input closed before the task completed")]
    HumanInputClosed,

    /// Too many tool iterations or back-to-back handoffs
    #[error("Agent '{agent}' exceeded the limit of {limit} {what}")]
    TurnLimitExceeded {
        agent: String,
        limit: usize,
        what: &'static str,
    },

    #[error("Orchestration cancelled")]
    Cancelled,

    #[error("Runtime is not running")]
    RuntimeStopped,

    /// The caller stopped waiting for the orchestration result
    #[error("No orchestration result within {after:?}")]
    ResultTimeout { after: Duration },
}

impl OrchestrationError {
    /// Whether the error is raised during setup rather than inside a session
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidReference { .. } | Self::DuplicateAgent { .. }
        )
    }
}

/// A failed session: the error plus enough context to diagnose it. The
/// conversation is kept exactly as it stood when the failure happened.
#[derive(Debug, Error)]
#[error("Session failed in agent '{agent}': {source}")]
pub struct SessionError {
    pub agent: String,
    pub conversation: ConversationState,
    #[source]
    pub source: OrchestrationError,
}

impl SessionError {
    pub fn new(
        agent: impl Into<String>,
        conversation: ConversationState,
        source: OrchestrationError,
    ) -> Self {
        Self {
            agent: agent.into(),
            conversation,
            source,
        }
    }

    /// Last message appended before the failure
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.conversation.last()
    }

    /// Multi-line report with agent name and last message
    pub fn report(&self) -> String {
        let last = self
            .last_message()
            .map(|m| m.summary())
            .unwrap_or_else(|| "(no messages)".to_string());
        format!(
            "{}\n  agent: {}\n  last message: {}\n  messages in conversation: {}",
            self.source,
            self.agent,
            last,
            self.conversation.len()
        )
    }
}

pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;
