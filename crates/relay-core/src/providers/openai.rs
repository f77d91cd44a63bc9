//! OpenAI and Azure OpenAI chat-completions provider with streaming support

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::credentials::Credential;
use super::types::{
    ChatResponse, ChatResponseBlock, ChatUsage, DeltaSender, LlmProvider, ProviderBlock,
    ProviderContent, ProviderMessage, ProviderRole, StopReason, ToolDefinition,
};

pub const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// Which URL layout and auth style the endpoint uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `{base_url}/v1/chat/completions`, model named in the body
    OpenAi,
    /// `{endpoint}/openai/deployments/{deployment}/chat/completions?api-version=...`
    Azure { api_version: String },
}

/// Chat-completions provider
pub struct OpenAiProvider {
    client: Client,
    credential: Credential,
    base_url: String,
    model: String,
    max_tokens: u32,
    flavor: ApiFlavor,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("flavor", &self.flavor)
            .finish()
    }
}

impl OpenAiProvider {
    /// Provider for api.openai.com or any OpenAI-compatible server
    pub fn new(
        credential: Credential,
        model: String,
        base_url: String,
        max_tokens: u32,
    ) -> Result<Self> {
        Self::build(credential, model, base_url, max_tokens, ApiFlavor::OpenAi)
    }

    /// Provider for an Azure OpenAI deployment; `model` is the deployment name
    pub fn azure(
        credential: Credential,
        endpoint: String,
        deployment: String,
        api_version: String,
        max_tokens: u32,
    ) -> Result<Self> {
        Self::build(
            credential,
            deployment,
            endpoint,
            max_tokens,
            ApiFlavor::Azure { api_version },
        )
    }

    fn build(
        credential: Credential,
        model: String,
        base_url: String,
        max_tokens: u32,
        flavor: ApiFlavor,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            credential,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            max_tokens,
            flavor,
        })
    }

    fn endpoint_url(&self) -> String {
        match &self.flavor {
            ApiFlavor::OpenAi => format!("{}/v1/chat/completions", self.base_url),
            ApiFlavor::Azure { api_version } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url, self.model, api_version
            ),
        }
    }

    fn build_body(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        system: &str,
        stream: bool,
    ) -> Result<Value> {
        let openai_messages = Self::to_openai_messages(messages, system);

        let mut body = serde_json::json!({
            "max_tokens": self.max_tokens,
            "messages": openai_messages,
        });

        if self.flavor == ApiFlavor::OpenAi {
            body["model"] = Value::String(self.model.clone());
        }

        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(Self::to_openai_tools(tools))?;
        }

        if stream {
            body["stream"] = Value::Bool(true);
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        Ok(body)
    }

    /// Convert provider-agnostic messages to OpenAI wire format
    fn to_openai_messages(messages: &[ProviderMessage], system: &str) -> Vec<OpenAiMessage> {
        let mut result = vec![OpenAiMessage::text("system", system.to_string())];

        for msg in messages {
            match (&msg.role, &msg.content) {
                (ProviderRole::System, _) => {
                    // Already handled above
                }
                (role, ProviderContent::Text(text)) => {
                    let mut m = OpenAiMessage::text(&role.to_string(), text.clone());
                    m.name = msg.name.clone();
                    result.push(m);
                }
                (ProviderRole::Assistant, ProviderContent::Blocks(blocks)) => {
                    let mut text_parts = Vec::new();
                    let mut tool_calls = Vec::new();

                    for block in blocks {
                        match block {
                            ProviderBlock::Text { text } => text_parts.push(text.clone()),
                            ProviderBlock::ToolCall { id, name, input } => {
                                tool_calls.push(OpenAiToolCall {
                                    id: id.clone(),
                                    r#type: "function".to_string(),
                                    function: OpenAiFunction {
                                        name: name.clone(),
                                        arguments: serde_json::to_string(input)
                                            .unwrap_or_default(),
                                    },
                                });
                            }
                            ProviderBlock::ToolResult { .. } => {}
                        }
                    }

                    result.push(OpenAiMessage {
                        role: "assistant".to_string(),
                        content: if text_parts.is_empty() {
                            None
                        } else {
                            Some(text_parts.join("\n"))
                        },
                        name: msg.name.clone(),
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        tool_call_id: None,
                    });
                }
                (ProviderRole::User, ProviderContent::Blocks(blocks)) => {
                    // Tool results come as separate "tool" role messages
                    let mut text_parts = Vec::new();

                    for block in blocks {
                        match block {
                            ProviderBlock::Text { text } => text_parts.push(text.clone()),
                            ProviderBlock::ToolResult {
                                tool_call_id,
                                content,
                            } => {
                                result.push(OpenAiMessage {
                                    role: "tool".to_string(),
                                    content: Some(content.clone()),
                                    name: None,
                                    tool_calls: None,
                                    tool_call_id: Some(tool_call_id.clone()),
                                });
                            }
                            ProviderBlock::ToolCall { .. } => {}
                        }
                    }

                    if !text_parts.is_empty() {
                        result.push(OpenAiMessage::text("user", text_parts.join("\n")));
                    }
                }
            }
        }

        result
    }

    /// Convert tool definitions to OpenAI function format
    fn to_openai_tools(tools: &[ToolDefinition]) -> Vec<OpenAiToolDef> {
        tools
            .iter()
            .map(|t| OpenAiToolDef {
                r#type: "function".to_string(),
                function: OpenAiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    /// Convert a non-streamed response to provider-agnostic format
    fn from_openai_response(resp: OpenAiApiResponse) -> Result<ChatResponse> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("OpenAI response had no choices"))?;

        let mut blocks = Vec::new();

        if let Some(content) = choice.message.content
            && !content.is_empty()
        {
            blocks.push(ChatResponseBlock::Text { text: content });
        }

        if let Some(tool_calls) = choice.message.tool_calls {
            for tc in tool_calls {
                blocks.push(ChatResponseBlock::ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    input: parse_arguments(&tc.function.arguments),
                });
            }
        }

        Ok(ChatResponse {
            blocks,
            stop_reason: stop_reason(choice.finish_reason.as_deref()),
            usage: resp.usage.map(ChatUsage::from).unwrap_or_default(),
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let request = self
            .client
            .post(self.endpoint_url())
            .header("Content-Type", "application/json")
            .json(body);

        let response = self
            .credential
            .apply(request)
            .send()
            .await
            .context("Failed to send request to chat completions API")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Chat completions request failed with status {}: {}",
                status,
                error_text
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        match self.flavor {
            ApiFlavor::OpenAi => "openai",
            ApiFlavor::Azure { .. } => "azure",
        }
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        system: &str,
    ) -> Result<ChatResponse> {
        let body = self.build_body(messages, tools, system, false)?;

        debug!(
            "{} request: model={}, messages={}",
            self.provider_name(),
            self.model,
            messages.len()
        );

        let api_response: OpenAiApiResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .context("Failed to parse chat completions response")?;

        debug!(
            "{} response: choices={}, finish_reason={:?}",
            self.provider_name(),
            api_response.choices.len(),
            api_response.choices.first().map(|c| &c.finish_reason)
        );

        Self::from_openai_response(api_response)
    }

    async fn chat_stream(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        system: &str,
        deltas: &DeltaSender,
    ) -> Result<ChatResponse> {
        let body = self.build_body(messages, tools, system, true)?;

        debug!(
            "{} streaming request: model={}, messages={}",
            self.provider_name(),
            self.model,
            messages.len()
        );

        let response = self.post(&body).await?;
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut acc = StreamAccumulator::default();
        let mut saw_done = false;

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Stream read failed (connection reset?)")?;
            buffer.extend_from_slice(&chunk);

            // Split on raw newlines so multi-byte characters are never cut
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(line.trim()) {
                    SseLine::Done => {
                        saw_done = true;
                        break 'read;
                    }
                    SseLine::Skip => {}
                    SseLine::Chunk(parsed) => {
                        if let Some(text) = acc.apply(parsed) {
                            deltas.send(text).await;
                        }
                    }
                }
            }
        }

        // EOF without a terminator means the connection dropped mid-answer
        if !saw_done && acc.finish_reason.is_none() {
            bail!(
                "stream ended before completion (connection closed) after {} chars",
                acc.text.len()
            );
        }

        let response = acc.finish();
        debug!(
            "{} stream finished: blocks={}, stop_reason={:?}",
            self.provider_name(),
            response.blocks.len(),
            response.stop_reason
        );
        Ok(response)
    }
}

fn stop_reason(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("tool_calls") => StopReason::ToolUse,
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::Unknown,
    }
}

fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(arguments).unwrap_or_else(|e| {
        warn!("Malformed tool call arguments ({}): {}", e, arguments);
        Value::Object(serde_json::Map::new())
    })
}

// ── SSE handling ──

#[derive(Debug)]
enum SseLine {
    Chunk(OpenAiStreamChunk),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => SseLine::Chunk(chunk),
        Err(e) => {
            debug!("Skipping unparseable stream chunk: {}", e);
            SseLine::Skip
        }
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds streamed chunks into a complete response
#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    finish_reason: Option<String>,
    usage: ChatUsage,
}

impl StreamAccumulator {
    /// Apply one chunk; returns the text delta it carried, if any
    fn apply(&mut self, chunk: OpenAiStreamChunk) -> Option<String> {
        if let Some(usage) = chunk.usage {
            self.usage = usage.into();
        }

        let mut delta_text = String::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                delta_text.push_str(&content);
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                let entry = self.tool_calls.entry(tc.index).or_default();
                if let Some(id) = tc.id {
                    entry.id = id;
                }
                if let Some(function) = tc.function {
                    if let Some(name) = function.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(args) = function.arguments {
                        entry.arguments.push_str(&args);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }

        if delta_text.is_empty() {
            None
        } else {
            self.text.push_str(&delta_text);
            Some(delta_text)
        }
    }

    fn finish(self) -> ChatResponse {
        let mut blocks = Vec::new();
        if !self.text.is_empty() {
            blocks.push(ChatResponseBlock::Text { text: self.text });
        }
        for (index, call) in self.tool_calls {
            let id = if call.id.is_empty() {
                format!("call_{}", index)
            } else {
                call.id
            };
            blocks.push(ChatResponseBlock::ToolCall {
                id,
                name: call.name,
                input: parse_arguments(&call.arguments),
            });
        }
        ChatResponse {
            blocks,
            stop_reason: stop_reason(self.finish_reason.as_deref()),
            usage: self.usage,
        }
    }
}

// ── OpenAI wire types ──

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiToolDef {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiApiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<OpenAiUsage> for ChatUsage {
    fn from(u: OpenAiUsage) -> Self {
        ChatUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    index: u32,
    id: Option<String>,
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}
