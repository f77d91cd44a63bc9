//! In-process runtime
//!
//! Owns the model router, a shutdown token and a task tracker. Sessions are
//! spawned onto the runtime and every agent turn goes through
//! [`InProcessRuntime::execute_turn`], so `stop_when_idle` can wait for all
//! in-flight work before releasing resources.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::{OrchestrationError, Result};
use crate::providers::{
    ChatResponse, DeltaSender, ModelRouter, ProviderMessage, RouteError, ToolDefinition,
};

/// Everything the provider needs for one agent turn
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    pub agent: &'a str,
    pub system: &'a str,
    pub messages: &'a [ProviderMessage],
    pub tools: &'a [ToolDefinition],
}

struct RuntimeInner {
    router: Arc<ModelRouter>,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

/// Handle to a running runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct InProcessRuntime {
    inner: Arc<RuntimeInner>,
}

impl InProcessRuntime {
    /// Start a runtime that routes agent turns through `router`
    pub fn start(router: Arc<ModelRouter>) -> Self {
        info!(
            "Runtime started (provider: {}, model: {})",
            router.provider_name(),
            router.model()
        );
        Self {
            inner: Arc::new(RuntimeInner {
                router,
                shutdown_token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst) && !self.inner.shutdown_token.is_cancelled()
    }

    pub fn router(&self) -> &ModelRouter {
        &self.inner.router
    }

    /// Token cancelled when the runtime is cancelled or dropped
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown_token.clone()
    }

    /// Spawn a tracked task. Fails once the runtime is stopping.
    pub fn spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_running() || self.inner.tracker.is_closed() {
            return Err(OrchestrationError::RuntimeStopped);
        }
        Ok(self.inner.tracker.spawn(task))
    }

    /// Run one agent turn, forwarding streamed text to `deltas`. Transient
    /// failures are retried by the router; cancellation aborts the turn.
    pub async fn execute_turn(
        &self,
        request: TurnRequest<'_>,
        deltas: DeltaSender,
    ) -> Result<ChatResponse> {
        if !self.is_running() {
            return Err(OrchestrationError::RuntimeStopped);
        }
        debug!(
            "Turn for {}: {} messages, {} tools",
            request.agent,
            request.messages.len(),
            request.tools.len()
        );

        let call = self.inner.router.chat_stream(
            request.messages,
            request.tools,
            request.system,
            &deltas,
        );
        let result = tokio::select! {
            _ = self.inner.shutdown_token.cancelled() => return Err(OrchestrationError::Cancelled),
            result = self.inner.tracker.track_future(call) => result,
        };

        result.map_err(|e| match e {
            RouteError::Exhausted { attempts, last } => OrchestrationError::TransientAgentCall {
                agent: request.agent.to_string(),
                attempts,
                message: last,
            },
            RouteError::Fatal { message } => OrchestrationError::AgentCall {
                agent: request.agent.to_string(),
                message,
            },
        })
    }

    /// Abort in-flight turns. Sessions fail with `Cancelled`.
    pub fn cancel(&self) {
        info!("Runtime cancelled");
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.tracker.close();
        self.inner.shutdown_token.cancel();
    }

    /// Refuse new sessions, wait for running ones to finish, then release
    /// resources
    pub async fn stop_when_idle(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.tracker.close();
        if !self.inner.tracker.is_empty() {
            info!(
                "Waiting for {} runtime task(s) to finish",
                self.inner.tracker.len()
            );
        }
        self.inner.tracker.wait().await;
        self.inner.shutdown_token.cancel();
        info!("Runtime stopped");
    }
}

impl std::fmt::Debug for InProcessRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessRuntime")
            .field("running", &self.is_running())
            .field("tasks", &self.inner.tracker.len())
            .finish()
    }
}
