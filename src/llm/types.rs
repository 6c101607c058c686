//! Message and request types for model calls
//!
//! These are provider-neutral. The Anthropic client maps them onto its wire
//! format; the execution loop and the protocol adapter only ever see these.

use serde::{Deserialize, Serialize};

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Kind of content carried by a message or a choice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(rename = "type", default)]
    pub kind: ContentType,
    pub content: String,
    /// Speaker label, e.g. `VM` for corrective messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            kind: ContentType::Text,
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Requested response format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Text,
    JsonObject,
}

/// Everything needed for one model call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: f32,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            messages: Vec::new(),
            temperature: 0.7,
            response_format: ResponseFormat::Text,
            stop_sequences: Vec::new(),
            max_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = stop;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// One generated alternative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(rename = "type", default)]
    pub kind: ContentType,
    pub content: String,
}

/// Token usage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate usage from another instance
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    /// Calculate cost in USD based on model
    pub fn cost_usd(&self, model: &str) -> f64 {
        let (input_rate, output_rate) = match model {
            m if m.contains("opus") => (0.015, 0.075),
            m if m.contains("sonnet") => (0.003, 0.015),
            m if m.contains("haiku") => (0.0008, 0.004),
            _ => (0.003, 0.015),
        };

        let input_cost = (self.input_tokens as f64 / 1000.0) * input_rate;
        let output_cost = (self.output_tokens as f64 / 1000.0) * output_rate;
        input_cost + output_cost
    }
}

/// Response from a model call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub cost: f64,
}

impl GenerateResponse {
    /// Content of the first choice, if any
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.content.as_str())
    }
}

/// Static facts about a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDetails {
    pub id: String,
    /// Input window in tokens
    pub context_size: usize,
    pub max_output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serializes_type_field() {
        let message = Message::user("hello").with_name("VM");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value, json!({"role": "user", "type": "text", "content": "hello", "name": "VM"}));
    }

    #[test]
    fn test_message_type_defaults_to_text() {
        let message: Message = serde_json::from_value(json!({"role": "assistant", "content": "x"})).unwrap();
        assert_eq!(message.kind, ContentType::Text);
        assert_eq!(message.name, None);
    }

    #[test]
    fn test_request_builder() {
        let request = GenerateRequest::new("claude-sonnet-4-5")
            .with_system_prompt("sys")
            .with_message(Message::user("hi"))
            .with_temperature(0.2)
            .with_stop_sequences(vec!["END".to_string()])
            .with_max_tokens(100);
        assert_eq!(request.system_prompt.as_deref(), Some("sys"));
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.stop_sequences, vec!["END"]);
        assert_eq!(request.response_format, ResponseFormat::Text);
        assert_eq!(request.max_tokens, Some(100));
    }

    #[test]
    fn test_usage_cost() {
        let usage = Usage::new(1000, 1000);
        assert!((usage.cost_usd("claude-opus-4") - 0.09).abs() < 1e-9);
        assert!((usage.cost_usd("claude-sonnet-4") - 0.018).abs() < 1e-9);
        assert_eq!(usage.total(), 2000);
    }

    #[test]
    fn test_response_text() {
        let response = GenerateResponse {
            id: "msg_1".to_string(),
            model: "m".to_string(),
            choices: vec![Choice {
                kind: ContentType::Text,
                content: "let a = 1;".to_string(),
            }],
            usage: Usage::default(),
            cached: false,
            cost: 0.0,
        };
        assert_eq!(response.text(), Some("let a = 1;"));
    }
}
