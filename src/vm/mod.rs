//! Script VM - runs compiled scripts in a fresh, bounded Rhai engine
//!
//! Two backends share one driver:
//! - [`InlineDriver`] runs the script on tokio's blocking pool and stops it
//!   cooperatively, so partial variables survive a timeout
//! - [`IsolatedDriver`] runs it on a dedicated thread with tighter engine
//!   limits, passes values as JSON bytes and abandons the thread on timeout
//!
//! Scripts call host tools through a blocking request/reply channel that the
//! async driver services, so scripts run straight-line while tools do real
//! async work.

mod binding;
mod driver;
pub mod excerpt;
mod host;
mod inline;
mod isolated;
mod sandbox;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::abort::AbortSignal;
use crate::compiler::CompiledCode;
use crate::domain::{Signal, TraceSink};
use crate::objects::{ObjectInstance, ObjectMutation};
use crate::tools::{DEFAULT_SLOW_TOOL_MS, ToolImplementation};

pub use binding::{HostBinding, InlineBinding, IsolatedBinding, ObjectHandle, SealedRecord};
pub use inline::InlineDriver;
pub use isolated::IsolatedDriver;

/// Default wall-clock limit per execution
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Default memory ceiling per execution
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 32 * 1024 * 1024;

/// Which sandbox backend runs a script
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmBackend {
    #[default]
    Inline,
    Isolated,
}

impl VmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmBackend::Inline => "inline",
            VmBackend::Isolated => "isolated",
        }
    }
}

impl fmt::Display for VmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inline" => Ok(VmBackend::Inline),
            "isolated" => Ok(VmBackend::Isolated),
            other => Err(format!("Unknown VM backend: {}", other)),
        }
    }
}

/// Resource limits for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLimits {
    pub timeout: Duration,
    pub memory_limit_bytes: usize,
    /// Tool calls running longer than this get a `tool_slow` trace
    pub slow_tool_threshold: Duration,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            slow_tool_threshold: Duration::from_millis(DEFAULT_SLOW_TOOL_MS),
        }
    }
}

/// Everything one execution needs
#[derive(Debug, Clone)]
pub struct VmRequest {
    pub compiled: CompiledCode,
    /// Injected globals, by name
    pub variables: BTreeMap<String, Value>,
    pub tools: Vec<ToolImplementation>,
    /// Copied into mirrors for the duration of the run
    pub objects: Vec<ObjectInstance>,
    pub traces: TraceSink,
    pub abort: AbortSignal,
    pub limits: VmLimits,
}

impl VmRequest {
    pub fn new(compiled: CompiledCode) -> Self {
        Self {
            compiled,
            variables: BTreeMap::new(),
            tools: Vec::new(),
            objects: Vec::new(),
            traces: TraceSink::new(),
            abort: AbortSignal::never(),
            limits: VmLimits::default(),
        }
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolImplementation>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_objects(mut self, objects: Vec<ObjectInstance>) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_traces(mut self, traces: TraceSink) -> Self {
        self.traces = traces;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_limits(mut self, limits: VmLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// A failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VmError {
    #[error("{message}")]
    Execution {
        message: String,
        stack: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<u32>,
    },

    #[error("{message}")]
    Assignment {
        message: String,
        stack: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
    },

    #[error("Execution timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Execution exceeded the memory limit of {limit_bytes} bytes")]
    MemoryLimit {
        limit_bytes: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
    },

    #[error("Execution aborted: {reason}")]
    Aborted { reason: String },
}

/// How an execution ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VmOutcome {
    /// Ran to the end; `value` is the script's result
    Completed { value: Value },
    /// Deliberately paused or handed off
    Suspended { signal: Signal },
    Failed { error: VmError },
}

/// Result of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmExecutionResult {
    pub outcome: VmOutcome,
    /// Last observed non-function globals; partial on failure
    pub variables: BTreeMap<String, Value>,
    /// Hits per original line
    pub line_hits: BTreeMap<u32, u32>,
    /// Object changes to reconcile into the host instances
    pub mutations: Vec<ObjectMutation>,
}

impl VmExecutionResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, VmOutcome::Completed { .. })
    }

    pub fn signal(&self) -> Option<&Signal> {
        match &self.outcome {
            VmOutcome::Suspended { signal } => Some(signal),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&VmError> {
        match &self.outcome {
            VmOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Runs compiled scripts
#[async_trait]
pub trait VmDriver: Send + Sync {
    fn backend(&self) -> VmBackend;

    async fn execute(&self, request: VmRequest) -> VmExecutionResult;
}

/// Driver for a backend
pub fn driver_for(backend: VmBackend) -> Arc<dyn VmDriver> {
    match backend {
        VmBackend::Inline => Arc::new(InlineDriver::new()),
        VmBackend::Isolated => Arc::new(IsolatedDriver::new()),
    }
}
