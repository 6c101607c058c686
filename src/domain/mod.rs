//! Domain types for codeloop
//!
//! This module contains the value types that flow through the engine:
//! - Exit: named final actions a script may return
//! - Signal: cooperative suspension and control transfer raised by scripts
//! - Trace: append-only observability events and the shared sink
//! - Iteration: the recorded outcome of one model-call/execute cycle

pub mod exit;
pub mod iteration;
pub mod signal;
pub mod trace;

pub use exit::Exit;
pub use iteration::{Iteration, IterationError, IterationStatus, LlmCallMetadata};
pub use signal::{
    CorrelationSignal, ExecuteSignal, InterruptSignal, ListenSignal, Signal, SignalKind, ThinkSignal,
    ToolCallAssignment, ToolCallInfo, TransitionSignal,
};
pub use trace::{ToolCallTrace, Trace, TraceSink, trace_types};
