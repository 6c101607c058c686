//! Model client trait, its error type and a scripted mock

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::types::{Choice, ContentType, GenerateRequest, GenerateResponse, ModelDetails, Usage};

/// Default input window when a model is not otherwise known
pub const DEFAULT_CONTEXT_SIZE: usize = 200_000;

/// Stateless model client - each call is independent
///
/// The execution loop treats it as opaque and never retries a failed call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError>;

    fn model_details(&self, model: &str) -> ModelDetails;
}

/// Errors that can occur during model calls
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Context overflow: used {used} tokens, limit is {limit}")]
    ContextOverflow { used: usize, limit: usize },

    #[error("Missing API key: environment variable {env_var} not set")]
    MissingApiKey { env_var: String },
}

impl LlmError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// Whether a caller outside the loop could reasonably try again
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::ApiError { status, .. } => *status >= 500,
            LlmError::Network(_) => true,
            LlmError::InvalidResponse(_)
            | LlmError::JsonError(_)
            | LlmError::ContextOverflow { .. }
            | LlmError::MissingApiKey { .. } => false,
        }
    }
}

/// Rough token estimation (actual tokenization varies)
/// Claude uses ~4 characters per token on average for English text
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Client that replays scripted responses in order
///
/// Every request is recorded so tests can inspect the message windows the
/// loop sent.
#[derive(Debug)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<GenerateRequest>>,
    context_size: usize,
}

impl MockLlmClient {
    pub fn new<S: Into<String>>(responses: Vec<S>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            requests: Mutex::new(Vec::new()),
            context_size: DEFAULT_CONTEXT_SIZE,
        }
    }

    /// Queue a failing call after the scripted responses
    pub fn with_error(self, error: LlmError) -> Self {
        lock(&self.responses).push_back(Err(error));
        self
    }

    pub fn with_context_size(mut self, context_size: usize) -> Self {
        self.context_size = context_size;
        self
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<GenerateRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.responses).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let input_tokens = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum::<usize>()
            + request.system_prompt.as_deref().map(estimate_tokens).unwrap_or(0);
        let n = {
            let mut requests = lock(&self.requests);
            requests.push(request.clone());
            requests.len()
        };

        let next = lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::InvalidResponse("no scripted responses left".to_string())));
        let content = next?;
        let usage = Usage::new(input_tokens as u64, estimate_tokens(&content) as u64);

        Ok(GenerateResponse {
            id: format!("mock-{}", n),
            model: request.model.clone(),
            cost: usage.cost_usd(&request.model),
            choices: vec![Choice {
                kind: ContentType::Text,
                content,
            }],
            usage,
            cached: false,
        })
    }

    fn model_details(&self, model: &str) -> ModelDetails {
        ModelDetails {
            id: model.to_string(),
            context_size: self.context_size,
            max_output_tokens: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::Message;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("Hello, world!"), 4);
        assert_eq!(estimate_tokens("abcd"), 1);
    }

    #[test]
    fn test_llm_error_is_retryable() {
        assert!(
            LlmError::RateLimited {
                retry_after: Duration::from_secs(60)
            }
            .is_retryable()
        );
        assert!(
            LlmError::ApiError {
                status: 500,
                message: "Internal error".to_string()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::ApiError {
                status: 400,
                message: "Bad request".to_string()
            }
            .is_retryable()
        );
        assert!(!LlmError::InvalidResponse("bad".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_mock_replays_in_order() {
        let client = MockLlmClient::new(vec!["first", "second"]);
        let request = GenerateRequest::new("mock-model").with_message(Message::user("hi"));

        let a = client.generate(request.clone()).await.unwrap();
        let b = client.generate(request.clone()).await.unwrap();
        assert_eq!(a.text(), Some("first"));
        assert_eq!(b.text(), Some("second"));
        assert_eq!(client.call_count(), 2);
        assert_eq!(client.remaining(), 0);

        let err = client.generate(request).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_mock_scripted_error() {
        let client = MockLlmClient::new(Vec::<String>::new()).with_error(LlmError::ApiError {
            status: 503,
            message: "overloaded".to_string(),
        });
        let err = client.generate(GenerateRequest::new("m")).await.unwrap_err();
        assert_eq!(err.to_string(), "API error 503: overloaded");
    }

    #[test]
    fn test_mock_model_details() {
        let client = MockLlmClient::new(vec!["x"]).with_context_size(8000);
        let details = client.model_details("m");
        assert_eq!(details.context_size, 8000);
        assert_eq!(details.id, "m");
    }
}
