//! Shared async driver for both backends
//!
//! The driver starts the sandbox worker, services its host calls through the
//! tool bridge, and races everything against the timeout and the abort
//! signal. Backends only decide where the worker runs, which binding and
//! engine limits it gets, and whether a stopped worker is waited for.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::excerpt;
use super::host::{HostCall, HostChannel, HostReply, HostRequest};
use super::sandbox::{
    EngineLimits, FailureKind, RawFailure, RawOutcome, SandboxJob, SandboxReport, SandboxState,
};
use super::{HostBinding, VmBackend, VmError, VmExecutionResult, VmLimits, VmOutcome, VmRequest};
use crate::compiler::CompiledCode;
use crate::domain::{Signal, Trace, TraceSink};
use crate::id::now_ms;
use crate::objects::ObjectMirror;
use crate::tools::{ToolBridge, ToolCallRequest, ToolError};

/// Where and how a sandbox worker runs
pub(crate) trait SandboxBackend: Send + Sync {
    type Binding: HostBinding;

    fn kind(&self) -> VmBackend;

    fn binding(&self) -> Self::Binding;

    fn engine_limits(&self, limits: &VmLimits) -> EngineLimits;

    /// Start the worker; its report arrives on the returned channel
    fn spawn(&self, job: SandboxJob<Self::Binding>) -> oneshot::Receiver<SandboxReport>;

    /// Whether a stopped worker is awaited for its partial variables
    fn waits_for_worker(&self) -> bool;
}

enum Stop {
    Timeout,
    Aborted(String),
}

pub(crate) async fn execute<S: SandboxBackend>(backend: &S, request: VmRequest) -> VmExecutionResult {
    let VmRequest {
        compiled,
        variables,
        tools,
        objects,
        traces,
        abort,
        limits,
    } = request;

    let started_at = now_ms();
    let mirrors: Vec<ObjectMirror> = objects
        .iter()
        .map(|object| ObjectMirror::new(object, traces.clone()))
        .collect();
    let state = Arc::new(SandboxState::default());
    let bridge = ToolBridge::new(traces.clone()).with_slow_threshold(limits.slow_tool_threshold);
    let (tx, mut calls) = mpsc::unbounded_channel::<HostCall>();

    log::debug!(
        "Executing {} line script on {} backend",
        compiled.source.lines().count(),
        backend.kind()
    );

    let job = SandboxJob {
        binding: backend.binding(),
        compiled: compiled.clone(),
        variables,
        tools,
        mirrors: mirrors.clone(),
        limits: backend.engine_limits(&limits),
        deadline: Instant::now() + limits.timeout,
        state: state.clone(),
        host: HostChannel::new(tx),
        traces: traces.clone(),
    };
    let mut report_rx = backend.spawn(job);
    let timeout = tokio::time::sleep(limits.timeout);
    tokio::pin!(timeout);

    let finished: Result<SandboxReport, Stop> = loop {
        tokio::select! {
            report = &mut report_rx => break Ok(report.unwrap_or_else(|_| worker_lost())),
            Some(call) = calls.recv() => {
                let HostCall { request, reply } = call;
                let answer = tokio::select! {
                    answer = service(&bridge, &traces, request) => answer,
                    _ = &mut timeout => break Err(Stop::Timeout),
                    reason = abort.aborted() => break Err(Stop::Aborted(reason)),
                };
                // The worker may already be gone
                let _ = reply.send(answer);
            }
            _ = &mut timeout => break Err(Stop::Timeout),
            reason = abort.aborted() => break Err(Stop::Aborted(reason)),
        }
    };

    let timeout_ms = limits.timeout.as_millis() as u64;
    let (outcome, variables) = match finished {
        Ok(report) => {
            let outcome = match report.outcome {
                RawOutcome::Completed(value) => VmOutcome::Completed { value },
                RawOutcome::Suspended(signal) => VmOutcome::Suspended {
                    signal: annotate_signal(signal, &report.variables, &state, &compiled),
                },
                RawOutcome::Failed(failure) => VmOutcome::Failed {
                    error: map_failure(failure, &state, &compiled, &limits, abort.reason()),
                },
            };
            (outcome, report.variables)
        }
        Err(stop) => {
            state.kill();
            drop(calls);
            let variables = if backend.waits_for_worker() {
                report_rx.await.map(|r| r.variables).unwrap_or_default()
            } else {
                BTreeMap::new()
            };
            let error = match stop {
                Stop::Timeout => VmError::Timeout { timeout_ms },
                Stop::Aborted(reason) => VmError::Aborted { reason },
            };
            log::warn!("Script stopped on {} backend: {}", backend.kind(), error);
            (VmOutcome::Failed { error }, variables)
        }
    };

    let line_hits = state.line_hits();
    record_outcome(&traces, &outcome, started_at, line_hits.len());

    VmExecutionResult {
        outcome,
        variables,
        line_hits,
        mutations: mirrors.iter().flat_map(ObjectMirror::mutations).collect(),
    }
}

async fn service(bridge: &ToolBridge, traces: &TraceSink, request: HostRequest) -> HostReply {
    match request {
        HostRequest::Tool {
            tool,
            object,
            input,
            assignment,
            line,
        } => {
            let call = ToolCallRequest {
                object,
                input,
                assignment,
                line,
            };
            match bridge.invoke(&tool, call).await {
                Ok(value) => HostReply::Value(value),
                Err(ToolError::Signal(signal)) => HostReply::Signal(signal),
                Err(ToolError::Failed(message)) => HostReply::Error(message),
            }
        }
        HostRequest::Yield { value } => {
            traces.push(Trace::Yield {
                started_at: now_ms(),
                value,
            });
            HostReply::Value(Value::Null)
        }
    }
}

fn worker_lost() -> SandboxReport {
    log::error!("Sandbox worker exited without a report");
    SandboxReport {
        outcome: RawOutcome::Failed(RawFailure {
            kind: FailureKind::Execution,
            message: "Sandbox worker exited without a result".to_string(),
            line: None,
            column: None,
        }),
        variables: BTreeMap::new(),
    }
}

/// Attach suspension context to an interrupt
fn annotate_signal(
    signal: Signal,
    variables: &BTreeMap<String, Value>,
    state: &SandboxState,
    compiled: &CompiledCode,
) -> Signal {
    match signal {
        Signal::Interrupt(mut interrupt) => {
            if interrupt.variables.is_empty() {
                interrupt.variables = variables.clone();
            }
            if interrupt.line.is_none() {
                interrupt.line = state.line();
            }
            if interrupt.stack.is_none() {
                interrupt.stack = interrupt
                    .line
                    .map(|line| excerpt::signal_excerpt(&compiled.source, line));
            }
            Signal::Interrupt(interrupt)
        }
        other => other,
    }
}

fn map_failure(
    failure: RawFailure,
    state: &SandboxState,
    compiled: &CompiledCode,
    limits: &VmLimits,
    abort_reason: Option<String>,
) -> VmError {
    let line = failure.line.or_else(|| state.line());
    let column = match (line, failure.column) {
        (Some(line), Some(column)) => Some(compiled.source_map.original_column(line, column)),
        _ => None,
    };
    let stack = line
        .map(|line| excerpt::error_excerpt(&compiled.source, line, column))
        .unwrap_or_default();

    match failure.kind {
        FailureKind::Execution => VmError::Execution {
            message: failure.message,
            stack,
            line,
            column,
        },
        FailureKind::Assignment => VmError::Assignment {
            message: failure.message,
            stack,
            line,
        },
        FailureKind::Timeout => VmError::Timeout {
            timeout_ms: limits.timeout.as_millis() as u64,
        },
        FailureKind::Memory => VmError::MemoryLimit {
            limit_bytes: limits.memory_limit_bytes,
            line,
        },
        FailureKind::Killed => VmError::Aborted {
            reason: abort_reason.unwrap_or(failure.message),
        },
    }
}

fn record_outcome(traces: &TraceSink, outcome: &VmOutcome, started_at: u64, lines_executed: usize) {
    traces.push(Trace::CodeExecution {
        started_at,
        ended_at: now_ms(),
        lines_executed: lines_executed as u32,
    });

    let VmOutcome::Failed { error } = outcome else {
        return;
    };
    if let VmError::Aborted { reason } = error {
        traces.push(Trace::AbortSignal {
            started_at: now_ms(),
            reason: reason.clone(),
        });
    }
    let (stack_trace, line, column) = match error {
        VmError::Execution {
            stack,
            line,
            column,
            ..
        } => (stack.clone(), *line, *column),
        VmError::Assignment { stack, line, .. } => (stack.clone(), *line, None),
        _ => (String::new(), None, None),
    };
    traces.push(Trace::CodeExecutionException {
        started_at: now_ms(),
        message: error.to_string(),
        stack_trace,
        line,
        column,
    });
}
