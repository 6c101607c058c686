//! Iteration records.
//!
//! An [`Iteration`] is the recorded outcome of one model-call → compile →
//! execute → classify cycle. It is built by the iteration executor and is
//! never changed after it is appended to a context's history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::signal::Signal;
use crate::domain::trace::Trace;
use crate::llm::Message;
use crate::objects::ObjectMutation;

/// Coarse outcome of an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    /// Reached a final action or a handoff signal
    Success,
    /// Asked to think again with new variables
    Partial,
    /// Compile, runtime, exit or limit failure
    Error,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::Success => "success",
            IterationStatus::Partial => "partial",
            IterationStatus::Error => "error",
        }
    }
}

/// Failure recorded on an iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IterationError {
    #[error("Invalid code: {message}")]
    InvalidCode { message: String },

    #[error("{message}")]
    CodeExecution { message: String, stack: String },

    #[error("Assignment error: {message}")]
    Assignment { message: String, stack: String },

    #[error("Execution timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Execution exceeded the memory limit of {limit_bytes} bytes")]
    MemoryLimit { limit_bytes: usize },

    #[error("Execution aborted: {reason}")]
    Aborted { reason: String },

    #[error("Invalid return statement (action: {action}): {message}")]
    Exit { action: String, message: String },

    #[error("Generation failed: {message}")]
    Generation { message: String },
}

impl IterationError {
    /// Source excerpt attached to runtime failures, if any
    pub fn stack(&self) -> Option<&str> {
        match self {
            IterationError::CodeExecution { stack, .. } | IterationError::Assignment { stack, .. } => {
                Some(stack)
            }
            _ => None,
        }
    }
}

/// Timing, usage and cost of the model call that produced an iteration's code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallMetadata {
    pub id: String,
    pub model: String,
    pub started_at: u64,
    pub ended_at: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub cached: bool,
    /// Raw model output before protocol parsing
    pub output: String,
}

/// One recorded cycle of the execution loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub status: IterationStatus,
    /// Last observed non-function values, by name
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    #[serde(default)]
    pub mutations: Vec<ObjectMutation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmCallMetadata>,
    #[serde(default)]
    pub traces: Vec<Trace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IterationError>,
    /// Exit taken by a successful return action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    /// Message window sent to the model
    #[serde(default)]
    pub messages: Vec<Message>,
    pub started_at: u64,
    pub ended_at: u64,
}

impl Iteration {
    pub fn is_success(&self) -> bool {
        self.status == IterationStatus::Success
    }

    pub fn is_interrupted(&self) -> bool {
        self.signal.as_ref().is_some_and(Signal::is_interrupt)
    }

    pub fn duration_ms(&self) -> u64 {
        self.ended_at.saturating_sub(self.started_at)
    }

    /// Traces of one serialized type, in order
    pub fn traces_of(&self, type_name: &str) -> Vec<&Trace> {
        self.traces
            .iter()
            .filter(|t| t.type_name() == type_name)
            .collect()
    }
}
