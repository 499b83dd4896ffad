//! Model-invocation capability.
//!
//! The orchestrator only knows the [`ModelInvoker`] trait: prompt in, raw text
//! out, or a typed [`InvocationError`]. Every request carries a mandatory
//! per-attempt timeout, which the orchestrator enforces around the call.

pub mod ollama;

pub use ollama::{OllamaConfig, OllamaInvoker};

use crate::error::InvocationError;
use async_trait::async_trait;
use std::time::Duration;

/// One model call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub prompt: String,
    pub model: String,
    pub max_output_tokens: usize,
    pub temperature: Option<f32>,
    /// Upper bound for this attempt.
    pub timeout: Duration,
}

/// Something that can turn a prompt into model text.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Send one prompt and return the raw response text.
    async fn invoke(&self, request: &InvocationRequest) -> Result<String, InvocationError>;
}

/// Run one attempt under the request's timeout.
pub async fn invoke_with_timeout(
    invoker: &dyn ModelInvoker,
    request: &InvocationRequest,
) -> Result<String, InvocationError> {
    match tokio::time::timeout(request.timeout, invoker.invoke(request)).await {
        Ok(result) => result,
        Err(_) => Err(InvocationError::Timeout {
            after: request.timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowInvoker;

    #[async_trait]
    impl ModelInvoker for SlowInvoker {
        fn name(&self) -> &str {
            "slow"
        }

        async fn invoke(&self, _request: &InvocationRequest) -> Result<String, InvocationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    fn request(timeout: Duration) -> InvocationRequest {
        InvocationRequest {
            prompt: "hello".to_string(),
            model: "test".to_string(),
            max_output_tokens: 10,
            temperature: None,
            timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_enforced() {
        let result = invoke_with_timeout(&SlowInvoker, &request(Duration::from_millis(50))).await;
        assert_eq!(
            result,
            Err(InvocationError::Timeout {
                after: Duration::from_millis(50)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_within_timeout_succeeds() {
        let result = invoke_with_timeout(&SlowInvoker, &request(Duration::from_secs(10))).await;
        tokio_test::assert_ok!(&result);
        assert_eq!(result.unwrap(), "late");
    }
}
