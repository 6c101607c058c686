//! Execution loop and iteration executor
//!
//! - [`Context`] holds the state of one conversation turn
//! - [`IterationExecutor`] runs one model-call, compile, execute cycle
//! - [`ExecutionLoop`] drives iterations and handles suspend and resume

mod context;
mod execution;
mod iteration;
mod observer;

pub use context::{Context, ContextOptions, DEFAULT_LOOP_LIMIT, DEFAULT_TEMPERATURE};
pub use execution::{ExecutionConfig, ExecutionLoop, ExecutionResult, ExecutionStatus};
pub use iteration::{IterationExecutor, IterationOutcome, window_budget};
pub use observer::{ExecutionObserver, NoOpObserver};
