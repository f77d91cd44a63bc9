//! One orchestration session: the active-agent state machine

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::view::agent_view;
use super::{OrchestrationConfig, OrchestrationResult};
use crate::agents::{AgentDefinition, AgentRegistry};
use crate::callbacks::{HumanInput, StreamingChunk, StreamingSink};
use crate::error::{OrchestrationError, Result, SessionError};
use crate::handoff::{HandoffAction, HandoffGraph, TASK_SUMMARY_ARG, task_summary};
use crate::providers::{
    ChatResponse, ChatResponseBlock, ChatUsage, DeltaSender, ProviderMessage, ToolDefinition,
};
use crate::runtime::{InProcessRuntime, TurnRequest};
use crate::tools::ToolExecutor;
use crate::types::{ChatMessage, ConversationState, FunctionCall, FunctionResult};

/// How an agent turn ended
#[derive(Debug, PartialEq)]
enum TurnOutcome {
    /// The agent answered without calling anything; the human speaks next
    AwaitUser,
    Handoff(String),
    Completed(String),
}

pub(super) struct Session {
    pub(super) id: String,
    pub(super) agents: Arc<AgentRegistry>,
    pub(super) handoffs: Arc<HandoffGraph>,
    pub(super) config: OrchestrationConfig,
    pub(super) sink: Option<Box<dyn StreamingSink>>,
    pub(super) human_input: Option<Arc<dyn HumanInput>>,
    pub(super) runtime: InProcessRuntime,
    pub(super) current: String,
    pub(super) conversation: ConversationState,
    pub(super) usage: ChatUsage,
    /// Side-effecting calls already made, keyed by name and arguments
    pub(super) side_effects: HashSet<(String, String)>,
}

impl Session {
    pub(super) async fn run(mut self, task: String) -> std::result::Result<OrchestrationResult, SessionError> {
        info!("Session {} started with agent '{}'", self.id, self.current);
        self.conversation.push(ChatMessage::user(task));

        match self.drive().await {
            Ok(summary) => {
                info!(
                    "Session {} completed by '{}' ({} messages, {} tokens)",
                    self.id,
                    self.current,
                    self.conversation.len(),
                    self.usage.total_tokens()
                );
                Ok(OrchestrationResult {
                    summary,
                    final_agent: self.current,
                    conversation: self.conversation,
                    usage: self.usage,
                })
            }
            Err(e) => {
                warn!("Session {} failed in '{}': {}", self.id, self.current, e);
                Err(SessionError::new(self.current, self.conversation, e))
            }
        }
    }

    async fn drive(&mut self) -> Result<String> {
        let mut handoffs_without_user = 0usize;
        loop {
            match self.run_agent_turn().await? {
                TurnOutcome::Completed(summary) => return Ok(summary),
                TurnOutcome::Handoff(target) => {
                    handoffs_without_user += 1;
                    if handoffs_without_user > self.config.max_handoffs_without_user {
                        return Err(OrchestrationError::TurnLimitExceeded {
                            agent: self.current.clone(),
                            limit: self.config.max_handoffs_without_user,
                            what: "consecutive handoffs",
                        });
                    }
                    info!("Handoff: {} -> {}", self.current, target);
                    self.current = target;
                }
                TurnOutcome::AwaitUser => {
                    let message = next_human_message(
                        self.human_input.clone(),
                        self.config.human_input_timeout,
                        self.runtime.shutdown_token(),
                    )
                    .await?;
                    self.conversation.push(message);
                    handoffs_without_user = 0;
                }
            }
        }
    }

    /// Let the active agent respond until it waits for the user, hands off
    /// or completes. Ordinary function calls keep the same agent going.
    async fn run_agent_turn(&mut self) -> Result<TurnOutcome> {
        let agent = self.agents.require(&self.current)?.clone();
        let mut tools = agent.tools().list_tools();
        tools.extend(self.handoffs.tool_definitions(agent.name()));

        for iteration in 0..self.config.max_tool_iterations {
            let messages = agent_view(&self.conversation, agent.name());
            let response = self.stream_turn(&agent, &messages, &tools).await?;
            self.usage.add(response.usage);
            debug!(
                "{} iteration {}: stop={:?}, tool calls={}",
                agent.name(),
                iteration + 1,
                response.stop_reason,
                response.has_tool_calls()
            );

            let text = response.text();
            if !text.is_empty() {
                self.conversation
                    .push(ChatMessage::agent_text(agent.name(), text));
            }

            let calls: Vec<FunctionCall> = response
                .blocks
                .into_iter()
                .filter_map(into_function_call)
                .collect();
            if calls.is_empty() {
                return Ok(TurnOutcome::AwaitUser);
            }

            // Every call is on record before any of them changes who is active
            for call in &calls {
                self.conversation
                    .push(ChatMessage::function_call(agent.name(), call.clone()));
                self.emit(StreamingChunk::function_call(agent.name(), call.clone()));
            }

            let mut outcome = None;
            for call in calls {
                if let Some(decided) = &outcome {
                    debug!("{} skipping {} after {:?}", agent.name(), call.name, decided);
                    let skipped = skipped_result(decided);
                    self.record_result(&agent, &call, Some(skipped));
                    continue;
                }
                outcome = self.handle_call(&agent, call).await?;
            }
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }

        Err(OrchestrationError::TurnLimitExceeded {
            agent: agent.name().to_string(),
            limit: self.config.max_tool_iterations,
            what: "tool iterations",
        })
    }

    /// Run one model call, forwarding streamed text to the sink while it
    /// arrives
    async fn stream_turn(
        &mut self,
        agent: &AgentDefinition,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        let author = agent.name();
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let request = TurnRequest {
            agent: author,
            system: agent.instructions(),
            messages,
            tools,
        };

        let runtime = &self.runtime;
        let sink = &mut self.sink;
        let turn = runtime.execute_turn(request, DeltaSender::new(tx));
        let forward = async {
            let mut streamed = false;
            while let Some(delta) = rx.recv().await {
                streamed = true;
                if let Some(sink) = sink.as_mut() {
                    sink.on_chunk(&StreamingChunk::text(author, delta), false);
                }
            }
            streamed
        };
        let (response, streamed) = tokio::join!(turn, forward);

        if let Some(sink) = self.sink.as_mut() {
            match &response {
                Ok(r) if !streamed && !r.text().is_empty() => {
                    sink.on_chunk(&StreamingChunk::text(author, r.text()), false);
                    sink.on_chunk(&StreamingChunk::end(author), true);
                }
                _ if streamed => sink.on_chunk(&StreamingChunk::end(author), true),
                _ => {}
            }
        }
        response
    }

    async fn handle_call(
        &mut self,
        agent: &AgentDefinition,
        call: FunctionCall,
    ) -> Result<Option<TurnOutcome>> {
        match HandoffAction::parse(&call.name) {
            Some(HandoffAction::Complete) => {
                let Some(summary) = task_summary(&call.arguments) else {
                    warn!("'{}' tried to complete without a task summary", agent.name());
                    let error = format!("Error: Missing required parameter '{}'", TASK_SUMMARY_ARG);
                    self.record_result(agent, &call, Some(error));
                    return Ok(None);
                };
                self.record_result(agent, &call, None);
                info!("Task completed by '{}': {}", agent.name(), summary);
                Ok(Some(TurnOutcome::Completed(summary)))
            }
            Some(HandoffAction::Transfer(target)) => {
                if !self.handoffs.allows(agent.name(), &target) {
                    warn!("Rejected handoff {} -> {}", agent.name(), target);
                    return Err(OrchestrationError::IllegalTransition {
                        from: agent.name().to_string(),
                        to: target,
                    });
                }
                self.record_result(agent, &call, None);
                Ok(Some(TurnOutcome::Handoff(target)))
            }
            None => {
                let output = self.execute_function(agent, &call).await;
                self.record_result(agent, &call, Some(output));
                Ok(None)
            }
        }
    }

    /// Execute a capability function. Failures become the function result
    /// so the model can recover.
    async fn execute_function(&mut self, agent: &AgentDefinition, call: &FunctionCall) -> String {
        if let Some(handler) = agent.tools().get(&call.name)
            && handler.has_side_effects()
            && !self
                .side_effects
                .insert((call.name.clone(), call.arguments.to_string()))
        {
            warn!(
                "NonIdempotentSideEffect: '{}' executed again with identical arguments {} in session {}",
                call.name, call.arguments, self.id
            );
        }

        debug!("{} calling {} with {}", agent.name(), call.name, call.arguments);
        match agent.tools().execute(&call.name, call.arguments.clone()).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Function '{}' failed for '{}': {}", call.name, agent.name(), e);
                format!("Error: {}", e)
            }
        }
    }

    fn record_result(&mut self, agent: &AgentDefinition, call: &FunctionCall, result: Option<String>) {
        let result = FunctionResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result,
        };
        self.conversation
            .push(ChatMessage::function_result(agent.name(), result.clone()));
        self.emit(StreamingChunk::function_result(agent.name(), result));
    }

    fn emit(&mut self, chunk: StreamingChunk) {
        if let Some(sink) = self.sink.as_mut() {
            sink.on_chunk(&chunk, true);
        }
    }
}

/// Wait for the next user message. Closed input, `exit` and `quit` end the
/// session.
async fn next_human_message(
    input: Option<Arc<dyn HumanInput>>,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
) -> Result<ChatMessage> {
    let Some(input) = input else {
        debug!("No human input source configured");
        return Err(OrchestrationError::HumanInputClosed);
    };

    let read = async {
        match timeout {
            Some(after) => tokio::time::timeout(after, input.next_message())
                .await
                .map_err(|_| OrchestrationError::HumanInputTimeout { after }),
            None => Ok(input.next_message().await),
        }
    };
    let next = tokio::select! {
        _ = shutdown.cancelled() => return Err(OrchestrationError::Cancelled),
        next = read => next?,
    };

    match next {
        Ok(Some(message)) if is_exit(&message) => Err(OrchestrationError::HumanInputClosed),
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(OrchestrationError::HumanInputClosed),
        Err(e) => {
            warn!("Human input failed: {}", e);
            Err(OrchestrationError::HumanInputClosed)
        }
    }
}

/// Result for a call that came after a handoff or completion in the same
/// response; it is recorded but never acted on
fn skipped_result(decided: &TurnOutcome) -> String {
    match decided {
        TurnOutcome::Handoff(target) => {
            format!("Skipped: control was transferred to {}", target)
        }
        TurnOutcome::Completed(_) => "Skipped: the task was already completed".to_string(),
        TurnOutcome::AwaitUser => "Skipped".to_string(),
    }
}

fn into_function_call(block: ChatResponseBlock) -> Option<FunctionCall> {
    match block {
        ChatResponseBlock::ToolCall { id, name, input } => Some(FunctionCall {
            id,
            name,
            arguments: input,
        }),
        ChatResponseBlock::Text { .. } => None,
    }
}

fn is_exit(message: &ChatMessage) -> bool {
    let text = message.text();
    let text = text.trim();
    text.eq_ignore_ascii_case("exit") || text.eq_ignore_ascii_case("quit")
}
