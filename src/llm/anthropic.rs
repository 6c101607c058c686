//! Anthropic API client implementation
//!
//! This module implements the LlmClient trait for the Anthropic (Claude) API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use super::client::{DEFAULT_CONTEXT_SIZE, LlmClient, LlmError};
use super::types::{Choice, ContentType, GenerateRequest, GenerateResponse, ModelDetails, Role, Usage};

/// Anthropic API base URL
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default model to use
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default max tokens
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Default environment variable holding the API key
pub const DEFAULT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Configuration for the Anthropic client
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub api_key_env: String,
    pub context_window: usize,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: Duration::from_secs(300),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            context_window: DEFAULT_CONTEXT_SIZE,
        }
    }
}

impl AnthropicConfig {
    /// Create a new config with a specific model
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Anthropic API client
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    config: AnthropicConfig,
    usage: Arc<Mutex<Usage>>,
}

impl AnthropicClient {
    /// Create a new Anthropic client
    ///
    /// Reads the API key from the environment variable named in the config
    pub fn new(config: AnthropicConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| LlmError::MissingApiKey {
            env_var: config.api_key_env.clone(),
        })?;

        Self::with_api_key(api_key, config)
    }

    /// Create a client with an explicit API key
    pub fn with_api_key(api_key: String, config: AnthropicConfig) -> Result<Self, LlmError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            api_key,
            config,
            usage: Arc::new(Mutex::new(Usage::default())),
        })
    }

    /// Build the request body for the Anthropic API
    ///
    /// System-role messages are folded into the top-level system prompt.
    fn build_request(&self, request: &GenerateRequest) -> Value {
        let model = if request.model.is_empty() {
            self.config.model.clone()
        } else {
            request.model.clone()
        };
        let max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);

        let mut system: Vec<&str> = request.system_prompt.iter().map(String::as_str).collect();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => system.push(&message.content),
                Role::User | Role::Assistant => messages.push(json!({
                    "role": if message.role == Role::User { "user" } else { "assistant" },
                    "content": message.content
                })),
            }
        }

        let mut body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": request.temperature,
            "messages": messages
        });

        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }

        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(request.stop_sequences);
        }

        body
    }

    /// Parse the API response into a GenerateResponse
    fn parse_response(&self, body: Value) -> Result<GenerateResponse, LlmError> {
        let id = body["id"].as_str().unwrap_or_default().to_string();
        let model = body["model"].as_str().unwrap_or(&self.config.model).to_string();

        let usage = match body.get("usage") {
            Some(u) => Usage::new(
                u["input_tokens"].as_u64().unwrap_or(0),
                u["output_tokens"].as_u64().unwrap_or(0),
            ),
            None => Usage::default(),
        };
        let cached = body["usage"]["cache_read_input_tokens"].as_u64().unwrap_or(0) > 0;

        self.usage.lock().unwrap_or_else(|e| e.into_inner()).add(&usage);

        let blocks = body["content"]
            .as_array()
            .ok_or_else(|| LlmError::InvalidResponse("missing content blocks".to_string()))?;
        let text: Vec<&str> = blocks
            .iter()
            .filter(|b| b["type"].as_str() == Some("text"))
            .filter_map(|b| b["text"].as_str())
            .collect();

        Ok(GenerateResponse {
            id,
            cost: usage.cost_usd(&model),
            model,
            choices: vec![Choice {
                kind: ContentType::Text,
                content: text.join("\n"),
            }],
            usage,
            cached,
        })
    }

    /// Send a request to the Anthropic API
    async fn send_request(&self, body: Value) -> Result<Value, LlmError> {
        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        // Handle rate limiting
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }

        // Handle other errors
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }

    /// Get cumulative token usage
    pub fn total_usage(&self) -> Usage {
        self.usage.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_ready(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let body = self.build_request(&request);
        log::debug!(
            "Sending {} messages to {}",
            request.messages.len(),
            body["model"].as_str().unwrap_or_default()
        );
        let response = self.send_request(body).await?;
        self.parse_response(response)
    }

    fn model_details(&self, model: &str) -> ModelDetails {
        ModelDetails {
            id: model.to_string(),
            context_size: self.config.context_window,
            max_output_tokens: self.config.max_tokens,
        }
    }
}

// Keep the API key out of debug output
impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("model", &self.config.model)
            .field("max_tokens", &self.config.max_tokens)
            .finish()
    }
}
