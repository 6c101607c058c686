//! Tool bridge
//!
//! Every script-initiated tool call goes through [`ToolBridge::invoke`]. The
//! bridge owns the observability contract: exactly one `tool_call` trace per
//! invocation, a deferred `tool_slow` trace for calls that run long, and a
//! `signal` trace for any signal a tool raises.

use std::time::Duration;

use serde_json::Value;

use super::implementation::{ToolCallContext, ToolError, ToolImplementation};
use super::schema;
use crate::domain::{Signal, ToolCallAssignment, ToolCallInfo, ToolCallTrace, Trace, TraceSink};
use crate::id::{generate_tool_call_id, now_ms};

/// Default warning threshold for slow tools
pub const DEFAULT_SLOW_TOOL_MS: u64 = 15_000;

/// One call as issued by a script
#[derive(Debug, Clone, Default)]
pub struct ToolCallRequest {
    pub object: Option<String>,
    pub input: Value,
    /// Assignment target of the call site, when the compiler tracked it
    pub assignment: Option<ToolCallAssignment>,
    /// Original script line of the call
    pub line: Option<u32>,
}

/// Runs tool calls on behalf of sandboxed code
#[derive(Debug, Clone)]
pub struct ToolBridge {
    traces: TraceSink,
    slow_threshold: Duration,
}

impl ToolBridge {
    pub fn new(traces: TraceSink) -> Self {
        Self {
            traces,
            slow_threshold: Duration::from_millis(DEFAULT_SLOW_TOOL_MS),
        }
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Invoke a tool and classify its outcome
    ///
    /// Signals are returned as `ToolError::Signal` and recorded as a
    /// successful call. Interrupts get the call's metadata attached.
    pub async fn invoke(
        &self,
        tool: &ToolImplementation,
        request: ToolCallRequest,
    ) -> Result<Value, ToolError> {
        let call_id = generate_tool_call_id();
        let started_at = now_ms();
        let logged_input = match &tool.input_schema {
            Some(s) => schema::parse(s, &request.input).unwrap_or_else(|_| request.input.clone()),
            None => request.input.clone(),
        };
        let ctx = ToolCallContext {
            call_id: call_id.clone(),
            tool_name: tool.name.clone(),
            object: request.object.clone(),
        };

        log::debug!("Invoking tool {} ({})", tool.name, call_id);

        let call = tool.call(request.input.clone(), &ctx);
        tokio::pin!(call);
        let slow = tokio::time::sleep(self.slow_threshold);
        tokio::pin!(slow);
        let mut warned = false;

        let outcome = loop {
            tokio::select! {
                result = &mut call => break result,
                _ = &mut slow, if !warned => {
                    warned = true;
                    let duration_ms = now_ms().saturating_sub(started_at);
                    log::warn!("Tool {} still running after {} ms", tool.name, duration_ms);
                    self.traces.push(Trace::ToolSlow {
                        started_at: now_ms(),
                        tool_call_id: call_id.clone(),
                        tool_name: tool.name.clone(),
                        object: request.object.clone(),
                        input: logged_input.clone(),
                        duration_ms,
                    });
                }
            }
        };

        let mut trace = ToolCallTrace {
            tool_call_id: call_id.clone(),
            tool_name: tool.name.clone(),
            object: request.object.clone(),
            input: logged_input,
            output: None,
            error: None,
            success: true,
            started_at,
            ended_at: now_ms(),
        };

        let result = match outcome {
            Ok(value) => {
                trace.output = Some(value.clone());
                Ok(value)
            }
            Err(ToolError::Signal(signal)) => Err(ToolError::Signal(
                self.attach_call_info(signal, tool, &call_id, &request),
            )),
            Err(ToolError::Failed(message)) => {
                log::debug!("Tool {} failed: {}", tool.name, message);
                trace.success = false;
                trace.error = Some(message.clone());
                Err(ToolError::Failed(message))
            }
        };

        self.traces.push(Trace::ToolCall(trace));
        if let Err(ToolError::Signal(signal)) = &result {
            self.traces.push(Trace::signal(signal.clone(), request.line));
        }
        result
    }

    fn attach_call_info(
        &self,
        signal: Signal,
        tool: &ToolImplementation,
        call_id: &str,
        request: &ToolCallRequest,
    ) -> Signal {
        match signal {
            Signal::Interrupt(mut interrupt) => {
                if interrupt.tool_call.is_none() {
                    interrupt.tool_call = Some(ToolCallInfo {
                        id: call_id.to_string(),
                        name: tool.name.clone(),
                        object: request.object.clone(),
                        input_schema: tool.input_schema.clone(),
                        output_schema: tool.output_schema.clone(),
                        input: request.input.clone(),
                        assignment: request.assignment.clone(),
                    });
                }
                if interrupt.line.is_none() {
                    interrupt.line = request.line;
                }
                Signal::Interrupt(interrupt)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trace_types;
    use serde_json::json;

    fn tool_calls(sink: &TraceSink) -> Vec<ToolCallTrace> {
        sink.snapshot()
            .into_iter()
            .filter_map(|t| match t {
                Trace::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    fn request(input: Value) -> ToolCallRequest {
        ToolCallRequest {
            input,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_records_one_trace() {
        let sink = TraceSink::new();
        let bridge = ToolBridge::new(sink.clone());
        let tool = ToolImplementation::from_sync_fn("double", |v| {
            Ok(json!(v.as_i64().unwrap_or(0) * 2))
        });

        let out = bridge.invoke(&tool, request(json!(21))).await.unwrap();
        assert_eq!(out, json!(42));

        let calls = tool_calls(&sink);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].success);
        assert_eq!(calls[0].output, Some(json!(42)));
        assert!(calls[0].ended_at >= calls[0].started_at);
    }

    #[tokio::test]
    async fn test_failure_records_error() {
        let sink = TraceSink::new();
        let bridge = ToolBridge::new(sink.clone());
        let tool = ToolImplementation::from_sync_fn("broken", |_| Err(ToolError::failed("nope")));

        let err = bridge.invoke(&tool, request(Value::Null)).await.unwrap_err();
        assert_eq!(err, ToolError::failed("nope"));

        let calls = tool_calls(&sink);
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].success);
        assert_eq!(calls[0].error.as_deref(), Some("nope"));
        assert_eq!(sink.count(trace_types::SIGNAL), 0);
    }

    #[tokio::test]
    async fn test_signal_counts_as_success() {
        let sink = TraceSink::new();
        let bridge = ToolBridge::new(sink.clone());
        let tool = ToolImplementation::from_sync_fn("handoff", |_| {
            Err(Signal::transition("billing").into())
        });

        let err = bridge.invoke(&tool, request(Value::Null)).await.unwrap_err();
        assert!(matches!(err, ToolError::Signal(Signal::Transition(_))));

        let calls = tool_calls(&sink);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].success);
        assert_eq!(sink.count(trace_types::SIGNAL), 1);
    }

    #[tokio::test]
    async fn test_interrupt_gets_call_metadata() {
        let sink = TraceSink::new();
        let bridge = ToolBridge::new(sink);
        let tool = ToolImplementation::from_sync_fn("getPayment", |_| {
            Err(Signal::interrupt("awaiting payment").into())
        })
        .with_input_schema(json!({"type": "object"}));

        let req = ToolCallRequest {
            object: Some("order".to_string()),
            input: json!({"id": 7}),
            assignment: Some(ToolCallAssignment {
                variable: "payment".to_string(),
                callee: "getPayment".to_string(),
                line: 3,
            }),
            line: Some(3),
        };
        let err = bridge.invoke(&tool, req).await.unwrap_err();
        let ToolError::Signal(Signal::Interrupt(interrupt)) = err else {
            panic!("expected interrupt");
        };
        let info = interrupt.tool_call.unwrap();
        assert_eq!(info.name, "getPayment");
        assert_eq!(info.object.as_deref(), Some("order"));
        assert_eq!(info.input, json!({"id": 7}));
        assert_eq!(info.assignment.unwrap().variable, "payment");
        assert_eq!(interrupt.line, Some(3));
    }

    #[tokio::test]
    async fn test_logged_input_fills_defaults_but_call_gets_raw() {
        let sink = TraceSink::new();
        let bridge = ToolBridge::new(sink.clone());
        let tool = ToolImplementation::from_sync_fn("greet", Ok).with_input_schema(json!({
            "type": "object",
            "properties": {"greeting": {"type": "string", "default": "hello"}}
        }));

        let out = bridge.invoke(&tool, request(json!({}))).await.unwrap();
        assert_eq!(out, json!({}));
        let calls = tool_calls(&sink);
        assert_eq!(calls[0].input, json!({"greeting": "hello"}));
    }

    #[tokio::test]
    async fn test_slow_tool_warns_without_cancelling() {
        let sink = TraceSink::new();
        let bridge = ToolBridge::new(sink.clone()).with_slow_threshold(Duration::from_millis(10));
        let tool = ToolImplementation::from_fn("sleepy", |_, _| async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok(json!("done"))
        });

        let out = bridge.invoke(&tool, request(Value::Null)).await.unwrap();
        assert_eq!(out, json!("done"));
        assert_eq!(sink.count(trace_types::TOOL_SLOW), 1);
        assert_eq!(sink.count(trace_types::TOOL_CALL), 1);
    }
}
