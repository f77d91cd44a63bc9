//! Scripted provider and sample agents for orchestration tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::agents::{AgentDefinition, AgentRegistry};
use crate::handoff::HandoffGraph;
use crate::providers::{
    ChatResponse, ChatResponseBlock, ChatUsage, DeltaSender, LlmProvider, ModelRouter,
    ProviderMessage, StopReason, ToolDefinition,
};
use crate::runtime::InProcessRuntime;
use crate::tools::orders;

/// What the provider saw on one call
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: String,
    pub messages: Vec<ProviderMessage>,
    pub tools: Vec<String>,
}

/// Replays canned responses in order and records every request
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<VecDeque<anyhow::Result<ChatResponse>>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    chunk_size: usize,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ChatResponse>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().map(Ok).collect())),
            calls: Arc::default(),
            chunk_size: 4,
        }
    }

    pub fn push_error(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!(message.to_string())));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn chat(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        system: &str,
    ) -> anyhow::Result<ChatResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            system: system.to_string(),
            messages: messages.to_vec(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
    }

    /// Streams the text in small pieces, the way a real endpoint would
    async fn chat_stream(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        system: &str,
        deltas: &DeltaSender,
    ) -> anyhow::Result<ChatResponse> {
        let response = self.chat(messages, tools, system).await?;
        let chars: Vec<char> = response.text().chars().collect();
        for piece in chars.chunks(self.chunk_size.max(1)) {
            deltas.send(piece.iter().collect::<String>()).await;
        }
        Ok(response)
    }
}

pub fn text(text: &str) -> ChatResponse {
    ChatResponse {
        blocks: vec![ChatResponseBlock::Text {
            text: text.to_string(),
        }],
        stop_reason: StopReason::EndTurn,
        usage: ChatUsage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

pub fn call(name: &str, input: Value) -> ChatResponse {
    calls(&[(name, input)])
}

pub fn calls(calls: &[(&str, Value)]) -> ChatResponse {
    ChatResponse {
        blocks: calls
            .iter()
            .map(|(name, input)| ChatResponseBlock::ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect(),
        stop_reason: StopReason::ToolUse,
        usage: ChatUsage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

pub fn transfer(target: &str) -> ChatResponse {
    call(&format!("Handoff-transfer_to_{}", target), json!({}))
}

pub fn complete(summary: &str) -> ChatResponse {
    call("Handoff-complete_task", json!({"task_summary": summary}))
}

pub fn customer_support_agents() -> AgentRegistry {
    AgentRegistry::from_agents([
        AgentDefinition::new("SupportAgent")
            .with_description("A customer support agent that triages issues.")
            .with_instructions(
                "Handle customer support requests and triage them to the appropriate agents.",
            ),
        AgentDefinition::new("RefundAgent")
            .with_description("A customer support agent that handles refunds.")
            .with_instructions("Handle refund requests.")
            .with_plugin(orders::order_refund_plugin()),
        AgentDefinition::new("OrderStatusAgent")
            .with_description("A customer support agent that checks order status.")
            .with_instructions("Handle order status requests.")
            .with_plugin(orders::order_status_plugin()),
        AgentDefinition::new("OrderReturnAgent")
            .with_description("A customer support agent that handles order returns.")
            .with_instructions("Handle order return requests.")
            .with_plugin(orders::order_return_plugin()),
    ])
    .unwrap()
}

pub fn customer_support_handoffs(agents: &AgentRegistry) -> HandoffGraph {
    HandoffGraph::new(agents)
        .add_many(
            "SupportAgent",
            [
                ("RefundAgent", "Transfer to this agent if the issue is refund related"),
                ("OrderStatusAgent", "Transfer to this agent if the issue is order status related"),
                ("OrderReturnAgent", "Transfer to this agent if the issue is order return related"),
            ],
        )
        .unwrap()
        .add("RefundAgent", "SupportAgent", "Transfer to this agent if the issue is not refund related")
        .unwrap()
        .add("OrderStatusAgent", "SupportAgent", "Transfer to this agent if the issue is not order status related")
        .unwrap()
        .add("OrderReturnAgent", "SupportAgent", "Transfer to this agent if the issue is not order return related")
        .unwrap()
}

/// Runtime whose router fails fast, so error tests do not sleep
pub fn scripted_runtime(provider: &ScriptedProvider) -> InProcessRuntime {
    let router = ModelRouter::single(Box::new(provider.clone()))
        .with_max_retries(2)
        .with_base_retry_delay(Duration::from_millis(1))
        .with_max_retry_delay(Duration::from_millis(2));
    InProcessRuntime::start(Arc::new(router))
}
