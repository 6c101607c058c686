//! Protocol adapters
//!
//! A protocol adapter owns the prompting convention: how model output is
//! parsed into code, which stop sequences end a response, and how the
//! system prompt and the corrective messages are worded. The execution loop
//! only talks to the [`ProtocolAdapter`] trait.

mod fenced;
mod render;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::domain::{Exit, ThinkSignal};
use crate::error::Result;
use crate::llm::Message;
use crate::objects::ObjectInstance;
use crate::snapshot::Snapshot;
use crate::tools::ToolImplementation;

pub use fenced::{FencedProtocol, FN_END, FN_START};
pub use render::PromptRenderer;

/// Header every corrective message starts with
pub const VM_MESSAGE_HEADER: &str = "## Important message from the VM";

/// Speaker name on corrective messages
pub const VM_SPEAKER: &str = "VM";

/// What a model response turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Code,
    /// Nothing usable was produced
    Empty,
}

/// A model response split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub kind: ResponseKind,
    pub code: String,
    pub raw: String,
}

/// Everything the prompt is rendered from
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub instructions: &'a str,
    pub objects: &'a [ObjectInstance],
    pub tools: &'a [ToolImplementation],
    pub exits: &'a [Exit],
    pub transcript: &'a [Message],
}

/// Prompting convention used by the execution loop
pub trait ProtocolAdapter: Send + Sync {
    fn version(&self) -> &str;

    fn parse_response(&self, raw: &str) -> ParsedResponse;

    fn stop_sequences(&self) -> Vec<String>;

    fn system_message(&self, inputs: &PromptInputs<'_>) -> Result<Message>;

    fn initial_user_message(&self, inputs: &PromptInputs<'_>) -> Result<Message>;

    /// Echo of the code the model wrote, in the form it should write it
    fn assistant_message(&self, code: &str) -> Message;

    fn invalid_code_message(&self, code: &str, error: &str) -> Message;

    fn execution_error_message(&self, message: &str, stack: &str) -> Message;

    fn thinking_message(&self, signal: &ThinkSignal) -> Message;

    fn snapshot_resolved_message(
        &self,
        snapshot: &Snapshot,
        value: &Value,
        variables: &BTreeMap<String, Value>,
    ) -> Message;

    fn snapshot_rejected_message(&self, snapshot: &Snapshot, error: &str) -> Message;

    /// When true, a think with no tracked assignments still counts as
    /// executed code and the iteration is partial
    fn reports_code_executed(&self) -> bool {
        false
    }
}
