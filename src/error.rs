//! Error types for codeloop
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::llm::LlmError;

/// All error types that can escape a codeloop operation
#[derive(Debug, Error)]
pub enum CodeloopError {
    /// Iteration budget exhausted
    #[error("Loop exceeded: reached the limit of {0} iterations")]
    LoopExceeded(u32),

    /// Run was cancelled through its abort signal
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Model-calling collaborator failed
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Model output could not be interpreted by the protocol adapter
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Snapshot was missing, unsettled or settled twice
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Context failed validation before the run started
    #[error("Invalid context: {0}")]
    InvalidContext(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for codeloop operations
pub type Result<T> = std::result::Result<T, CodeloopError>;
