//! Shared conversation types for relay-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a message in the conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthorRole {
    User,
    Agent,
    FunctionCall,
    FunctionResult,
}

impl std::fmt::Display for AuthorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::FunctionCall => write!(f, "function_call"),
            Self::FunctionResult => write!(f, "function_result"),
        }
    }
}

/// A function invocation requested by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The outcome of a function invocation. `result` is `None` for functions
/// that return nothing (handoff and completion calls).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResult {
    pub call_id: String,
    pub name: String,
    pub result: Option<String>,
}

/// One piece of message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text { text: String },
    FunctionCall(FunctionCall),
    FunctionResult(FunctionResult),
}

/// A message in the orchestration conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: AuthorRole,
    /// Name of the agent that produced this message (`None` for the human)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub items: Vec<ContentItem>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn with_items(role: AuthorRole, author: Option<String>, items: Vec<ContentItem>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            author,
            items,
            timestamp: Utc::now(),
        }
    }

    /// A message typed by the human
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_items(
            AuthorRole::User,
            None,
            vec![ContentItem::Text { text: text.into() }],
        )
    }

    /// Plain text produced by an agent
    pub fn agent_text(agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_items(
            AuthorRole::Agent,
            Some(agent.into()),
            vec![ContentItem::Text { text: text.into() }],
        )
    }

    pub fn function_call(agent: impl Into<String>, call: FunctionCall) -> Self {
        Self::with_items(
            AuthorRole::FunctionCall,
            Some(agent.into()),
            vec![ContentItem::FunctionCall(call)],
        )
    }

    pub fn function_result(agent: impl Into<String>, result: FunctionResult) -> Self {
        Self::with_items(
            AuthorRole::FunctionResult,
            Some(agent.into()),
            vec![ContentItem::FunctionResult(result)],
        )
    }

    /// Concatenated text content of this message
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.as_str()),
                ContentItem::FunctionCall(_) | ContentItem::FunctionResult(_) => None,
            })
            .collect()
    }

    /// Short single-line rendering used in error reports
    pub fn summary(&self) -> String {
        let who = self.author.as_deref().unwrap_or("User");
        let body = match self.items.first() {
            Some(ContentItem::Text { .. }) | None => self.text(),
            Some(ContentItem::FunctionCall(call)) => {
                format!("call {}({})", call.name, call.arguments)
            }
            Some(ContentItem::FunctionResult(result)) => format!(
                "result of {}: {}",
                result.name,
                result.result.as_deref().unwrap_or("None")
            ),
        };
        let mut line = format!("{}: {}", who, body);
        if line.len() > 200 {
            let mut cut = 200;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            line.push_str("...");
        }
        line
    }
}

/// Append-only conversation history for one orchestration session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages authored by a given agent, in order
    pub fn by_agent<'a>(&'a self, agent: &'a str) -> impl Iterator<Item = &'a ChatMessage> + 'a {
        self.messages
            .iter()
            .filter(move |m| m.author.as_deref() == Some(agent))
    }
}
