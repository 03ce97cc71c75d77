use evidence::estimate_tokens;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::InvocationError;
use crate::llm::{ChatModel, RawResponse};
use crate::prompt::AssessmentRequest;
use crate::retry::RetryPolicy;
use crate::usage::{TimedOperation, Usage};

/// Sends requests to the model with per-call timeout, retry and a shared
/// limit on concurrent calls.
pub struct ModelInvoker {
    model: Arc<dyn ChatModel>,
    policy: RetryPolicy,
    limiter: Arc<Semaphore>,
    timeout: Duration,
    usage: Arc<Usage>,
}

impl ModelInvoker {
    pub fn new(
        model: Arc<dyn ChatModel>,
        policy: RetryPolicy,
        max_concurrent_calls: usize,
        timeout: Duration,
        usage: Arc<Usage>,
    ) -> Self {
        Self {
            model,
            policy,
            limiter: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            timeout,
            usage,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn usage(&self) -> &Arc<Usage> {
        &self.usage
    }

    /// Send `request`, retrying transient failures. The returned response
    /// records how many attempts it took.
    pub async fn invoke(&self, request: &AssessmentRequest) -> Result<RawResponse, InvocationError> {
        let operation = format!("assess {}", request.control_id);

        let (mut response, attempts) = self
            .policy
            .run(&operation, |attempt| self.attempt(request, attempt), |_| self.usage.record_retry())
            .await?;

        response.attempts = attempts;
        self.record_tokens(request, &response);
        Ok(response)
    }

    async fn attempt(&self, request: &AssessmentRequest, attempt: usize) -> Result<RawResponse, InvocationError> {
        // Held for the call only; backoff sleeps do not occupy a slot.
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| InvocationError::Config("model call limiter closed".to_string()))?;

        debug!(control_id = %request.control_id, attempt, chars = request.char_len(), "Calling model");

        let timer = TimedOperation::start();
        let result = match tokio::time::timeout(self.timeout, self.model.complete(&request.messages)).await {
            Ok(result) => result,
            Err(_) => Err(InvocationError::Timeout(self.timeout)),
        };
        self.usage.record_call(timer.elapsed(), result.as_ref().err());
        result
    }

    fn record_tokens(&self, request: &AssessmentRequest, response: &RawResponse) {
        match (response.prompt_tokens, response.completion_tokens) {
            (Some(prompt), Some(completion)) => self.usage.record_tokens(prompt, completion, false),
            _ => {
                let prompt: usize = request.messages.iter().map(|m| estimate_tokens(&m.content)).sum();
                let completion = estimate_tokens(&response.content);
                self.usage.record_tokens(prompt as u64, completion as u64, true);
            }
        }
    }
}
