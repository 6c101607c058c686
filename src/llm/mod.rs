//! LLM layer - model client abstraction and message-window handling
//!
//! This module provides:
//! - Message and request types for model calls
//! - LlmClient trait for API abstraction, plus a scripted mock
//! - AnthropicClient implementation
//! - Truncation of wrapped content to fit a model's context window

pub mod anthropic;
pub mod client;
pub mod truncate;
pub mod types;

pub use anthropic::{AnthropicClient, AnthropicConfig};
pub use client::{DEFAULT_CONTEXT_SIZE, LlmClient, LlmError, MockLlmClient, estimate_tokens};
pub use truncate::{Preserve, WrapOptions, strip_markers, truncate_wrapped, wrap, wrap_content};
pub use types::{
    Choice, ContentType, GenerateRequest, GenerateResponse, Message, ModelDetails, ResponseFormat, Role, Usage,
};
