//! Model router: retry with exponential backoff and failover across providers

use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{ChatResponse, DeltaSender, LlmProvider, ProviderMessage, ToolDefinition};

/// Why a routed call gave up
#[derive(Debug, Error)]
pub enum RouteError {
    /// Every attempt failed with a transient error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// A non-retriable failure, or a failure after output was already streamed
    #[error("{message}")]
    Fatal { message: String },
}

/// Routes LLM requests across providers with retries and automatic failover
pub struct ModelRouter {
    /// Providers in failover order (index 0 = primary)
    providers: Vec<Box<dyn LlmProvider>>,
    /// Maximum attempts per provider before moving to the next
    max_retries_per_provider: u32,
    /// Base delay for exponential backoff
    base_retry_delay: Duration,
    /// Upper bound for a single backoff sleep
    max_retry_delay: Duration,
    /// Timeout for a single attempt (a timed-out attempt is retryable)
    attempt_timeout: Duration,
}

impl ModelRouter {
    /// Create a router with a single provider (no failover)
    pub fn single(provider: Box<dyn LlmProvider>) -> Self {
        Self {
            providers: vec![provider],
            max_retries_per_provider: 3,
            base_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(120),
        }
    }

    /// Create a router with multiple providers in failover order
    pub fn with_failover(providers: Vec<Box<dyn LlmProvider>>) -> anyhow::Result<Self> {
        if providers.is_empty() {
            return Err(anyhow!("ModelRouter requires at least one provider"));
        }
        Ok(Self {
            providers,
            max_retries_per_provider: 2,
            base_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(120),
        })
    }

    /// Set the maximum attempts per provider
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries_per_provider = max_retries.max(1);
        self
    }

    /// Set the base retry delay for exponential backoff
    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Backoff before attempt `attempt + 1`
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }

    /// Send a streaming chat request, retrying transient failures and
    /// failing over to the next provider when retries run out
    pub async fn chat_stream(
        &self,
        messages: &[ProviderMessage],
        tools: &[ToolDefinition],
        system: &str,
        deltas: &DeltaSender,
    ) -> Result<ChatResponse, RouteError> {
        let mut last_error = None;
        let mut attempts = 0u32;

        for (idx, provider) in self.providers.iter().enumerate() {
            for attempt in 0..self.max_retries_per_provider {
                attempts += 1;
                debug!(
                    "Trying provider {} ({}/{}) attempt {}/{}",
                    provider.provider_name(),
                    provider.model(),
                    idx + 1,
                    attempt + 1,
                    self.max_retries_per_provider,
                );

                let outcome = tokio::time::timeout(
                    self.attempt_timeout,
                    provider.chat_stream(messages, tools, system, deltas),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(anyhow!(
                        "request timed out after {:?}",
                        self.attempt_timeout
                    ))
                });

                match outcome {
                    Ok(response) => {
                        if idx > 0 {
                            info!(
                                "Request succeeded on failover provider {} ({})",
                                provider.provider_name(),
                                provider.model()
                            );
                        }
                        return Ok(response);
                    }
                    Err(e) => {
                        let err_str = format!("{:#}", e);
                        let is_retryable = is_retryable_error(&err_str);

                        warn!(
                            "Provider {} ({}) failed (attempt {}, retryable={}): {}",
                            provider.provider_name(),
                            provider.model(),
                            attempt + 1,
                            is_retryable,
                            err_str,
                        );

                        // Output already reached the sink; a retry would duplicate it
                        if deltas.has_emitted() {
                            return Err(RouteError::Fatal {
                                message: format!("stream interrupted: {}", err_str),
                            });
                        }

                        if !is_retryable {
                            last_error = Some(RouteError::Fatal { message: err_str });
                            break;
                        }

                        last_error = Some(RouteError::Exhausted {
                            attempts,
                            last: err_str,
                        });

                        if attempt + 1 < self.max_retries_per_provider {
                            let delay = self.backoff(attempt);
                            debug!("Backing off for {:?} before retry", delay);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }

            if idx + 1 < self.providers.len() {
                info!(
                    "Failing over from {} to {}",
                    provider.provider_name(),
                    self.providers[idx + 1].provider_name()
                );
            }
        }

        Err(last_error.unwrap_or_else(|| RouteError::Fatal {
            message: "All providers failed".to_string(),
        }))
    }

    /// Get the primary provider's model name
    pub fn model(&self) -> &str {
        self.providers
            .first()
            .map(|p| p.model())
            .unwrap_or("unknown")
    }

    /// Get the primary provider's name
    pub fn provider_name(&self) -> &str {
        self.providers
            .first()
            .map(|p| p.provider_name())
            .unwrap_or("unknown")
    }

    /// Number of configured providers
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

/// Determine if an error is transient (rate limit, server error, timeout, network)
pub fn is_retryable_error(err: &str) -> bool {
    let retryable_patterns = [
        "429",
        "500",
        "502",
        "503",
        "504",
        "rate limit",
        "rate_limit",
        "overloaded",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "connection closed",
        "temporarily unavailable",
        "failed to send request",
    ];
    let lower = err.to_lowercase();
    retryable_patterns.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::super::types::{ChatResponseBlock, ChatUsage, StopReason};

    /// Mock provider that succeeds
    struct SuccessProvider {
        name: String,
        model_name: String,
    }

    #[async_trait]
    impl LlmProvider for SuccessProvider {
        fn provider_name(&self) -> &str {
            &self.name
        }
        fn model(&self) -> &str {
            &self.model_name
        }
        async fn chat(
            &self,
            _messages: &[ProviderMessage],
            _tools: &[ToolDefinition],
            _system: &str,
        ) -> Result<ChatResponse> {
            Ok(ChatResponse {
                blocks: vec![ChatResponseBlock::Text {
                    text: format!("from {}", self.name),
                }],
                stop_reason: StopReason::EndTurn,
                usage: ChatUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }
    }

    /// Mock provider that fails a fixed number of times, then succeeds
    struct FlakyProvider {
        error: String,
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn provider_name(&self) -> &str {
            "flaky"
        }
        fn model(&self) -> &str {
            "flaky-model"
        }
        async fn chat(
            &self,
            _messages: &[ProviderMessage],
            _tools: &[ToolDefinition],
            _system: &str,
        ) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(anyhow!("{}", self.error));
            }
            Ok(ChatResponse {
                blocks: vec![ChatResponseBlock::Text {
                    text: "recovered".to_string(),
                }],
                stop_reason: StopReason::EndTurn,
                usage: ChatUsage::default(),
            })
        }
    }

    /// Streams a partial delta, then fails
    struct MidStreamFailProvider;

    #[async_trait]
    impl LlmProvider for MidStreamFailProvider {
        fn provider_name(&self) -> &str {
            "midstream"
        }
        fn model(&self) -> &str {
            "m"
        }
        async fn chat(
            &self,
            _messages: &[ProviderMessage],
            _tools: &[ToolDefinition],
            _system: &str,
        ) -> Result<ChatResponse> {
            Err(anyhow!("unused"))
        }
        async fn chat_stream(
            &self,
            _messages: &[ProviderMessage],
            _tools: &[ToolDefinition],
            _system: &str,
            deltas: &DeltaSender,
        ) -> Result<ChatResponse> {
            deltas.send("Hel").await;
            Err(anyhow!("connection reset by peer"))
        }
    }

    /// Never answers
    struct HangingProvider;

    #[async_trait]
    impl LlmProvider for HangingProvider {
        fn provider_name(&self) -> &str {
            "hanging"
        }
        fn model(&self) -> &str {
            "h"
        }
        async fn chat(
            &self,
            _messages: &[ProviderMessage],
            _tools: &[ToolDefinition],
            _system: &str,
        ) -> Result<ChatResponse> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn flaky(error: &str, failures: u32) -> (FlakyProvider, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            FlakyProvider {
                error: error.to_string(),
                failures,
                calls: calls.clone(),
            },
            calls,
        )
    }

    #[tokio::test]
    async fn test_single_provider_success() {
        let router = ModelRouter::single(Box::new(SuccessProvider {
            name: "test".to_string(),
            model_name: "test-model".to_string(),
        }));
        let result = router
            .chat_stream(&[], &[], "system", &DeltaSender::discard())
            .await
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let (provider, calls) = flaky("status 503: service unavailable", 2);
        let router = ModelRouter::single(Box::new(provider))
            .with_max_retries(3)
            .with_base_retry_delay(Duration::from_millis(1));

        let result = router
            .chat_stream(&[], &[], "system", &DeltaSender::discard())
            .await
            .unwrap();
        assert_eq!(result.text(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (provider, calls) = flaky("status 429: rate limit exceeded", 10);
        let router = ModelRouter::single(Box::new(provider))
            .with_max_retries(3)
            .with_base_retry_delay(Duration::from_millis(1));

        let err = router
            .chat_stream(&[], &[], "system", &DeltaSender::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let (provider, calls) = flaky("status 401: unauthorized", 10);
        let router = ModelRouter::single(Box::new(provider))
            .with_max_retries(3)
            .with_base_retry_delay(Duration::from_millis(1));

        let err = router
            .chat_stream(&[], &[], "system", &DeltaSender::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Fatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_not_retried() {
        let router = ModelRouter::single(Box::new(MidStreamFailProvider))
            .with_max_retries(3)
            .with_base_retry_delay(Duration::from_millis(1));
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let deltas = DeltaSender::new(tx);

        let err = router
            .chat_stream(&[], &[], "system", &deltas)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stream interrupted"));
        assert_eq!(rx.recv().await.unwrap(), "Hel");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let router = ModelRouter::single(Box::new(HangingProvider))
            .with_max_retries(2)
            .with_base_retry_delay(Duration::from_millis(1))
            .with_attempt_timeout(Duration::from_secs(5));

        let err = router
            .chat_stream(&[], &[], "system", &DeltaSender::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Exhausted { attempts: 2, .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_failover_to_second_provider() {
        let (primary, _) = flaky("status 500: server error", 10);
        let router = ModelRouter::with_failover(vec![
            Box::new(primary),
            Box::new(SuccessProvider {
                name: "fallback".to_string(),
                model_name: "fallback-model".to_string(),
            }),
        ])
        .unwrap()
        .with_max_retries(1)
        .with_base_retry_delay(Duration::from_millis(1));

        let result = router
            .chat_stream(&[], &[], "system", &DeltaSender::discard())
            .await
            .unwrap();
        assert_eq!(result.text(), "from fallback");
    }

    #[test]
    fn test_empty_providers_rejected() {
        assert!(ModelRouter::with_failover(vec![]).is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let router = ModelRouter::single(Box::new(SuccessProvider {
            name: "azure".to_string(),
            model_name: "gpt-4o".to_string(),
        }))
        .with_base_retry_delay(Duration::from_millis(100))
        .with_max_retry_delay(Duration::from_millis(350));

        assert_eq!(router.backoff(0), Duration::from_millis(100));
        assert_eq!(router.backoff(1), Duration::from_millis(200));
        assert_eq!(router.backoff(2), Duration::from_millis(350));
        assert_eq!(router.model(), "gpt-4o");
        assert_eq!(router.provider_name(), "azure");
        assert_eq!(router.provider_count(), 1);
    }

    #[test]
    fn test_is_retryable_error() {
        assert!(is_retryable_error("status 429: rate limit exceeded"));
        assert!(is_retryable_error("status 500: internal server error"));
        assert!(is_retryable_error("request timed out"));
        assert!(is_retryable_error("API overloaded"));
        assert!(!is_retryable_error("status 401: unauthorized"));
        assert!(!is_retryable_error("invalid API key"));
    }
}
