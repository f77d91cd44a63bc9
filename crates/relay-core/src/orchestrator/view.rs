//! Per-agent view of the shared conversation
//!
//! User messages and agent text are visible to every agent. Function calls
//! and their results stay private to the agent that made them, which keeps
//! every call paired with its result in the provider request.

use crate::providers::{ProviderBlock, ProviderContent, ProviderMessage, ProviderRole};
use crate::types::{AuthorRole, ContentItem, ConversationState};

/// Build the provider messages `agent` sees for its next turn
pub fn agent_view(conversation: &ConversationState, agent: &str) -> Vec<ProviderMessage> {
    let mut view: Vec<ProviderMessage> = Vec::new();

    for message in conversation.messages() {
        let own = message.author.as_deref() == Some(agent);
        match message.role {
            AuthorRole::User => {
                view.push(ProviderMessage::user(message.text()));
            }
            AuthorRole::Agent => {
                let text = message.text();
                if text.is_empty() {
                    continue;
                }
                let name = if own { None } else { message.author.clone() };
                append(&mut view, ProviderRole::Assistant, name, ProviderBlock::Text { text });
            }
            AuthorRole::FunctionCall | AuthorRole::FunctionResult if !own => {}
            AuthorRole::FunctionCall | AuthorRole::FunctionResult => {
                for item in &message.items {
                    match item {
                        ContentItem::FunctionCall(call) => append(
                            &mut view,
                            ProviderRole::Assistant,
                            None,
                            ProviderBlock::ToolCall {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                input: call.arguments.clone(),
                            },
                        ),
                        ContentItem::FunctionResult(result) => append(
                            &mut view,
                            ProviderRole::User,
                            None,
                            ProviderBlock::ToolResult {
                                tool_call_id: result.call_id.clone(),
                                content: result.result.clone().unwrap_or_else(|| "None".to_string()),
                            },
                        ),
                        ContentItem::Text { .. } => {}
                    }
                }
            }
        }
    }

    view
}

/// Merge `block` into the last message when role and speaker match, so one
/// model response (text plus calls) stays one assistant message
fn append(
    view: &mut Vec<ProviderMessage>,
    role: ProviderRole,
    name: Option<String>,
    block: ProviderBlock,
) {
    if let Some(last) = view.last_mut()
        && last.role == role
        && last.name == name
        && let ProviderContent::Blocks(blocks) = &mut last.content
        && can_merge(blocks, &block)
    {
        blocks.push(block);
        return;
    }
    view.push(ProviderMessage {
        role,
        name,
        content: ProviderContent::Blocks(vec![block]),
    });
}

/// Text after a tool call starts a new assistant message
fn can_merge(blocks: &[ProviderBlock], next: &ProviderBlock) -> bool {
    match next {
        ProviderBlock::Text { .. } => !blocks
            .iter()
            .any(|b| matches!(b, ProviderBlock::ToolCall { .. })),
        ProviderBlock::ToolCall { .. } | ProviderBlock::ToolResult { .. } => true,
    }
}
