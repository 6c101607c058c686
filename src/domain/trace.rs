//! Trace events for iteration observability.
//!
//! Traces are append-only: a [`TraceSink`] only ever pushes, and the list it
//! hands back preserves insertion order. The sink is shared between the
//! async driver and the sandbox worker thread, so it is internally locked.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::signal::Signal;
use crate::id::now_ms;

/// Trace type names as they appear in serialized output
pub mod trace_types {
    pub const LLM_CALL_STARTED: &str = "llm_call_started";
    pub const LLM_CALL_SUCCESS: &str = "llm_call_success";
    pub const COMMENT: &str = "comment";
    pub const LOG: &str = "log";
    pub const CODE_EXECUTION: &str = "code_execution";
    pub const PROPERTY: &str = "property";
    pub const TOOL_CALL: &str = "tool_call";
    pub const TOOL_SLOW: &str = "tool_slow";
    pub const SIGNAL: &str = "signal";
    pub const ABORT_SIGNAL: &str = "abort_signal";
    pub const CODE_EXECUTION_EXCEPTION: &str = "code_execution_exception";
    pub const INVALID_CODE_EXCEPTION: &str = "invalid_code_exception";
    pub const YIELD: &str = "yield";
}

/// One timestamped observability event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trace {
    LlmCallStarted {
        started_at: u64,
        model: String,
    },
    LlmCallSuccess {
        started_at: u64,
        ended_at: u64,
        model: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    Comment {
        started_at: u64,
        line: u32,
        comment: String,
    },
    Log {
        started_at: u64,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<Value>,
    },
    /// Line-hit summary for one execution
    CodeExecution {
        started_at: u64,
        ended_at: u64,
        lines_executed: u32,
    },
    Property {
        started_at: u64,
        object: String,
        property: String,
        value: Value,
    },
    ToolCall(ToolCallTrace),
    ToolSlow {
        started_at: u64,
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        object: Option<String>,
        input: Value,
        duration_ms: u64,
    },
    #[serde(rename = "signal")]
    SignalRaised {
        started_at: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        signal: Signal,
    },
    AbortSignal {
        started_at: u64,
        reason: String,
    },
    CodeExecutionException {
        started_at: u64,
        message: String,
        stack_trace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<u32>,
    },
    InvalidCodeException {
        started_at: u64,
        message: String,
        code: String,
    },
    Yield {
        started_at: u64,
        value: Value,
    },
}

impl Trace {
    /// Serialized type name of this trace
    pub fn type_name(&self) -> &'static str {
        match self {
            Trace::LlmCallStarted { .. } => trace_types::LLM_CALL_STARTED,
            Trace::LlmCallSuccess { .. } => trace_types::LLM_CALL_SUCCESS,
            Trace::Comment { .. } => trace_types::COMMENT,
            Trace::Log { .. } => trace_types::LOG,
            Trace::CodeExecution { .. } => trace_types::CODE_EXECUTION,
            Trace::Property { .. } => trace_types::PROPERTY,
            Trace::ToolCall(_) => trace_types::TOOL_CALL,
            Trace::ToolSlow { .. } => trace_types::TOOL_SLOW,
            Trace::SignalRaised { .. } => trace_types::SIGNAL,
            Trace::AbortSignal { .. } => trace_types::ABORT_SIGNAL,
            Trace::CodeExecutionException { .. } => trace_types::CODE_EXECUTION_EXCEPTION,
            Trace::InvalidCodeException { .. } => trace_types::INVALID_CODE_EXCEPTION,
            Trace::Yield { .. } => trace_types::YIELD,
        }
    }

    pub fn started_at(&self) -> u64 {
        match self {
            Trace::LlmCallStarted { started_at, .. }
            | Trace::LlmCallSuccess { started_at, .. }
            | Trace::Comment { started_at, .. }
            | Trace::Log { started_at, .. }
            | Trace::CodeExecution { started_at, .. }
            | Trace::Property { started_at, .. }
            | Trace::ToolSlow { started_at, .. }
            | Trace::SignalRaised { started_at, .. }
            | Trace::AbortSignal { started_at, .. }
            | Trace::CodeExecutionException { started_at, .. }
            | Trace::InvalidCodeException { started_at, .. }
            | Trace::Yield { started_at, .. } => *started_at,
            Trace::ToolCall(call) => call.started_at,
        }
    }

    /// Create a log trace stamped now
    pub fn log(message: impl Into<String>, args: Vec<Value>) -> Self {
        Trace::Log {
            started_at: now_ms(),
            message: message.into(),
            args,
        }
    }

    /// Create a signal trace stamped now
    pub fn signal(signal: Signal, line: Option<u32>) -> Self {
        Trace::SignalRaised {
            started_at: now_ms(),
            line,
            signal,
        }
    }
}

/// Record of one tool invocation, whatever its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallTrace {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Signals count as success
    pub success: bool,
    pub started_at: u64,
    pub ended_at: u64,
}

type TraceListener = Arc<dyn Fn(&Trace) + Send + Sync>;

/// Shared, append-only trace list
#[derive(Clone, Default)]
pub struct TraceSink {
    traces: Arc<Mutex<Vec<Trace>>>,
    listener: Option<TraceListener>,
}

impl TraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `listener` with every trace as it is pushed
    pub fn with_listener(mut self, listener: impl Fn(&Trace) + Send + Sync + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn push(&self, trace: Trace) {
        if let Some(listener) = &self.listener {
            listener(&trace);
        }
        self.traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(trace);
    }

    /// Copy of the traces recorded so far, in order
    pub fn snapshot(&self) -> Vec<Trace> {
        self.traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.traces.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of traces of the given serialized type
    pub fn count(&self, type_name: &str) -> usize {
        self.traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| t.type_name() == type_name)
            .count()
    }
}

impl fmt::Debug for TraceSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSink")
            .field("len", &self.len())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_trace_serializes_type_tag() {
        let trace = Trace::Property {
            started_at: 1,
            object: "user".to_string(),
            property: "name".to_string(),
            value: json!("Ada"),
        };
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["type"], "property");
        assert_eq!(json["object"], "user");
    }

    #[test]
    fn test_signal_trace_uses_signal_type_name() {
        let trace = Trace::signal(Signal::listen(), Some(4));
        assert_eq!(trace.type_name(), "signal");
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["type"], "signal");
        assert_eq!(json["signal"]["type"], "listen");
    }

    #[test]
    fn test_sink_preserves_order() {
        let sink = TraceSink::new();
        sink.push(Trace::log("first", vec![]));
        sink.push(Trace::log("second", vec![]));
        let traces = sink.snapshot();
        assert_eq!(traces.len(), 2);
        assert!(matches!(&traces[0], Trace::Log { message, .. } if message == "first"));
        assert!(matches!(&traces[1], Trace::Log { message, .. } if message == "second"));
    }

    #[test]
    fn test_sink_clones_share_storage() {
        let sink = TraceSink::new();
        let other = sink.clone();
        other.push(Trace::log("shared", vec![]));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_sink_listener_sees_every_push() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sink = TraceSink::new().with_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sink.push(Trace::log("a", vec![]));
        sink.push(Trace::log("b", vec![json!(1)]));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(sink.count(trace_types::LOG), 2);
    }
}
