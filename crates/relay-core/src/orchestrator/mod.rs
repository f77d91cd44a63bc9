//! Handoff orchestration
//!
//! [`HandoffOrchestration`] holds the immutable setup (agents, handoff graph,
//! entry agent, callbacks). Each [`HandoffOrchestration::invoke`] spawns a
//! session onto the runtime; the session owns the conversation and moves the
//! active agent along graph edges until an agent calls
//! `Handoff-complete_task`.

mod session;
pub mod view;

#[cfg(test)]
mod testing;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agents::AgentRegistry;
use crate::callbacks::{HumanInput, SinkFactory, StreamingSink};
use crate::error::{OrchestrationError, Result, SessionError};
use crate::handoff::HandoffGraph;
use crate::providers::ChatUsage;
use crate::runtime::InProcessRuntime;
use crate::types::ConversationState;
use session::Session;

/// Bounds on a single session
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    /// Model calls one agent may make before it must answer, hand off or complete
    pub max_tool_iterations: usize,
    /// Handoffs allowed in a row without a user message in between
    pub max_handoffs_without_user: usize,
    /// How long to wait for the human; `None` waits forever
    pub human_input_timeout: Option<Duration>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 10,
            max_handoffs_without_user: 8,
            human_input_timeout: None,
        }
    }
}

/// Outcome of a completed session
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    /// The `task_summary` passed to `Handoff-complete_task`, verbatim
    pub summary: String,
    /// Agent that completed the task
    pub final_agent: String,
    pub conversation: ConversationState,
    pub usage: ChatUsage,
}

/// A set of agents and the handoffs allowed between them
pub struct HandoffOrchestration {
    agents: Arc<AgentRegistry>,
    handoffs: Arc<HandoffGraph>,
    entry_agent: String,
    sink_factory: Option<SinkFactory>,
    human_input: Option<Arc<dyn HumanInput>>,
    config: OrchestrationConfig,
}

impl HandoffOrchestration {
    /// Validate the graph against the registry and fix the entry agent
    pub fn new(
        agents: AgentRegistry,
        mut handoffs: HandoffGraph,
        entry_agent: impl Into<String>,
    ) -> Result<Self> {
        let entry_agent = entry_agent.into();
        handoffs.validate(&agents, &entry_agent)?;
        info!(
            "HandoffOrchestration: {} agents, {} handoffs, entry '{}'",
            agents.len(),
            handoffs.edge_count(),
            entry_agent
        );

        Ok(Self {
            agents: Arc::new(agents),
            handoffs: Arc::new(handoffs),
            entry_agent,
            sink_factory: None,
            human_input: None,
            config: OrchestrationConfig::default(),
        })
    }

    /// Observe streamed output. The factory is called once per session.
    pub fn with_streaming_sink<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn StreamingSink> + Send + Sync + 'static,
    {
        self.sink_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_human_input(mut self, input: Arc<dyn HumanInput>) -> Self {
        self.human_input = Some(input);
        self
    }

    pub fn with_config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn handoffs(&self) -> &HandoffGraph {
        &self.handoffs
    }

    pub fn entry_agent(&self) -> &str {
        &self.entry_agent
    }

    /// Start a session for `task` on `runtime`. The task becomes the first
    /// user message and the entry agent takes the first turn.
    pub fn invoke(
        &self,
        task: impl Into<String>,
        runtime: &InProcessRuntime,
    ) -> Result<OrchestrationHandle> {
        if !runtime.is_running() {
            return Err(OrchestrationError::RuntimeStopped);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let session = Session {
            id: id.clone(),
            agents: self.agents.clone(),
            handoffs: self.handoffs.clone(),
            config: self.config.clone(),
            sink: self.sink_factory.as_ref().map(|factory| factory()),
            human_input: self.human_input.clone(),
            runtime: runtime.clone(),
            current: self.entry_agent.clone(),
            conversation: ConversationState::new(),
            usage: ChatUsage::default(),
            side_effects: HashSet::new(),
        };

        let task = task.into();
        let join = runtime.spawn(session.run(task))?;
        Ok(OrchestrationHandle {
            id,
            entry_agent: self.entry_agent.clone(),
            join,
        })
    }
}

/// A running session. Await [`OrchestrationHandle::get`] for the result.
#[derive(Debug)]
pub struct OrchestrationHandle {
    id: String,
    entry_agent: String,
    join: JoinHandle<std::result::Result<OrchestrationResult, SessionError>>,
}

impl OrchestrationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the session to complete or fail
    pub async fn get(self) -> std::result::Result<OrchestrationResult, SessionError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Session {} task ended abnormally: {}", self.id, e);
                Err(SessionError::new(
                    self.entry_agent,
                    ConversationState::new(),
                    OrchestrationError::Cancelled,
                ))
            }
        }
    }

    /// Like [`OrchestrationHandle::get`], but gives up after `after` and
    /// aborts the session
    pub async fn get_timeout(
        self,
        after: Duration,
    ) -> std::result::Result<OrchestrationResult, SessionError> {
        let abort = self.join.abort_handle();
        let entry_agent = self.entry_agent.clone();
        match tokio::time::timeout(after, self.get()).await {
            Ok(result) => result,
            Err(_) => {
                abort.abort();
                Err(SessionError::new(
                    entry_agent,
                    ConversationState::new(),
                    OrchestrationError::ResultTimeout { after },
                ))
            }
        }
    }
}
