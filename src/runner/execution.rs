//! Execution loop
//!
//! Drives iterations for one [`Context`] until a final action, a handoff,
//! an interrupt or a fatal error. Resuming from a settled [`Snapshot`]
//! starts a fresh run that picks up where the interrupted one stopped.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::context::Context;
use super::iteration::IterationExecutor;
use super::observer::{ExecutionObserver, NoOpObserver};
use crate::abort::AbortSignal;
use crate::compiler::{Compiler, ScriptCompiler};
use crate::domain::{Iteration, IterationError, IterationStatus, Signal, Trace};
use crate::error::{CodeloopError, Result};
use crate::id::now_ms;
use crate::llm::LlmClient;
use crate::snapshot::{DefaultSnapshots, Snapshot, SnapshotCollaborator, SnapshotStatus};
use crate::vm::{VmBackend, VmDriver, VmLimits, driver_for};

/// Settings for the execution loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionConfig {
    pub backend: VmBackend,
    pub limits: VmLimits,
    pub max_tokens: Option<u32>,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Interrupted,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Interrupted => "interrupted",
            ExecutionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a run; the context carries the full iteration history
#[derive(Debug)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub context: Context,
    pub snapshot: Option<Snapshot>,
    pub signal: Option<Signal>,
    pub error: Option<CodeloopError>,
}

impl ExecutionResult {
    fn success(context: Context) -> Self {
        Self {
            status: ExecutionStatus::Success,
            context,
            snapshot: None,
            signal: None,
            error: None,
        }
    }

    fn interrupted(context: Context, snapshot: Snapshot, signal: Signal) -> Self {
        Self {
            status: ExecutionStatus::Interrupted,
            context,
            snapshot: Some(snapshot),
            signal: Some(signal),
            error: None,
        }
    }

    fn error(context: Context, error: CodeloopError) -> Self {
        Self {
            status: ExecutionStatus::Error,
            context,
            snapshot: None,
            signal: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_interrupted(&self) -> bool {
        self.status == ExecutionStatus::Interrupted
    }

    pub fn is_error(&self) -> bool {
        self.status == ExecutionStatus::Error
    }

    pub fn iterations(&self) -> &[Iteration] {
        self.context.iterations()
    }

    pub fn last_iteration(&self) -> Option<&Iteration> {
        self.context.last_iteration()
    }

    /// Exit taken by the final iteration
    pub fn exit(&self) -> Option<&str> {
        self.last_iteration().and_then(|i| i.exit.as_deref())
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.last_iteration().and_then(|i| i.return_value.as_ref())
    }
}

/// Runs a context to completion, suspension or failure
pub struct ExecutionLoop<L: LlmClient> {
    llm: Arc<L>,
    compiler: Arc<dyn Compiler>,
    vm: Arc<dyn VmDriver>,
    snapshots: Arc<dyn SnapshotCollaborator>,
    observer: Arc<dyn ExecutionObserver>,
    abort: AbortSignal,
    config: ExecutionConfig,
}

impl<L: LlmClient> ExecutionLoop<L> {
    pub fn new(llm: Arc<L>) -> Self {
        Self::with_config(llm, ExecutionConfig::default())
    }

    pub fn with_config(llm: Arc<L>, config: ExecutionConfig) -> Self {
        Self {
            llm,
            compiler: Arc::new(ScriptCompiler::new()),
            vm: driver_for(config.backend),
            snapshots: Arc::new(DefaultSnapshots),
            observer: Arc::new(NoOpObserver),
            abort: AbortSignal::never(),
            config,
        }
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_vm(mut self, vm: Arc<dyn VmDriver>) -> Self {
        self.vm = vm;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotCollaborator>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn executor(&self) -> IterationExecutor<L> {
        IterationExecutor::new(self.llm.clone(), self.compiler.clone(), self.vm.clone())
            .with_limits(self.config.limits)
            .with_max_tokens(self.config.max_tokens)
    }

    /// Run iterations until the context finishes, suspends or fails
    pub async fn run(&self, mut context: Context) -> ExecutionResult {
        if let Err(e) = context.validate() {
            return ExecutionResult::error(context, e);
        }
        if let Err(e) = self.apply_snapshot(&mut context) {
            return ExecutionResult::error(context, e);
        }

        tracing::info!(
            context_id = %context.id,
            backend = %self.vm.backend(),
            loop_limit = context.options.loop_limit,
            "Run started"
        );

        let executor = self.executor();
        loop {
            if self.abort.is_aborted() {
                let reason = self
                    .abort
                    .reason()
                    .unwrap_or_else(|| "aborted".to_string());
                self.record_abort(&mut context, &reason);
                tracing::warn!(context_id = %context.id, reason = %reason, "Run aborted");
                return ExecutionResult::error(context, CodeloopError::Aborted(reason));
            }

            if context.attempt() >= context.options.loop_limit {
                let limit = context.options.loop_limit;
                tracing::error!(context_id = %context.id, limit, "Loop limit exceeded");
                return ExecutionResult::error(context, CodeloopError::LoopExceeded(limit));
            }

            let outcome = executor
                .execute(&mut context, &self.abort, self.observer.clone())
                .await;
            let iteration = outcome.iteration;
            self.observer.on_iteration_end(&iteration);
            tracing::info!(
                context_id = %context.id,
                iteration = %iteration.id,
                status = iteration.status.as_str(),
                duration_ms = iteration.duration_ms(),
                "Iteration finished"
            );

            let status = iteration.status;
            let signal = iteration.signal.clone();
            let code = iteration.code.clone();
            let aborted = match &iteration.error {
                Some(IterationError::Aborted { reason }) => Some(reason.clone()),
                _ => None,
            };
            context.push_iteration(iteration);

            if let Some(error) = outcome.fatal {
                tracing::error!(context_id = %context.id, error = %error, "Run failed");
                return ExecutionResult::error(context, error);
            }

            if let Some(signal) = signal.filter(Signal::is_interrupt) {
                return match self.snapshots.create(&signal, code.as_deref()) {
                    Ok(snapshot) => {
                        tracing::info!(
                            context_id = %context.id,
                            snapshot_id = %snapshot.id,
                            "Run interrupted"
                        );
                        ExecutionResult::interrupted(context, snapshot, signal)
                    }
                    Err(e) => ExecutionResult::error(context, e),
                };
            }

            if let Some(reason) = aborted {
                tracing::warn!(context_id = %context.id, reason = %reason, "Run aborted");
                return ExecutionResult::error(context, CodeloopError::Aborted(reason));
            }

            if status == IterationStatus::Success {
                context.finish_attempt();
                tracing::info!(context_id = %context.id, "Run succeeded");
                return ExecutionResult::success(context);
            }
        }
    }

    /// Settle `snapshot` with a value and continue from it
    pub async fn resolve(
        &self,
        context: Context,
        mut snapshot: Snapshot,
        value: Value,
    ) -> ExecutionResult {
        if let Err(e) = snapshot.resolve(value) {
            return ExecutionResult::error(context, e);
        }
        self.run(context.with_snapshot(snapshot)).await
    }

    /// Settle `snapshot` with an error and continue from it
    pub async fn reject(
        &self,
        context: Context,
        mut snapshot: Snapshot,
        error: impl Into<String>,
    ) -> ExecutionResult {
        if let Err(e) = snapshot.reject(error) {
            return ExecutionResult::error(context, e);
        }
        self.run(context.with_snapshot(snapshot)).await
    }

    /// Restore a settled snapshot's variables and queue the resume message
    fn apply_snapshot(&self, context: &mut Context) -> Result<()> {
        let Some(snapshot) = context.take_snapshot() else {
            return Ok(());
        };

        context.variables.extend(snapshot.variables.clone());
        let message = match &snapshot.status {
            SnapshotStatus::Pending => {
                return Err(CodeloopError::Snapshot(format!(
                    "Snapshot {} has not been resolved or rejected",
                    snapshot.id
                )));
            }
            SnapshotStatus::Resolved { value } => {
                if let Some(assignment) = snapshot.tool_call().and_then(|c| c.assignment.as_ref()) {
                    context
                        .variables
                        .insert(assignment.variable.clone(), value.clone());
                }
                let protocol = context.protocol();
                protocol.snapshot_resolved_message(&snapshot, value, &context.variables)
            }
            SnapshotStatus::Rejected { error } => {
                context.protocol().snapshot_rejected_message(&snapshot, error)
            }
        };

        log::info!("Resuming context {} from snapshot {}", context.id, snapshot.id);
        context.push_messages([message]);
        context.set_correlation(Signal::SnapshotCorrelation(snapshot.correlation()));
        Ok(())
    }

    /// Append an iteration that records the abort
    fn record_abort(&self, context: &mut Context, reason: &str) {
        let now = now_ms();
        let trace = Trace::AbortSignal {
            started_at: now,
            reason: reason.to_string(),
        };
        self.observer.on_trace(&trace);
        let iteration = Iteration {
            id: context.begin_iteration(),
            code: None,
            status: IterationStatus::Error,
            variables: context.variables.clone(),
            signal: None,
            mutations: Vec::new(),
            llm: None,
            traces: vec![trace],
            error: Some(IterationError::Aborted {
                reason: reason.to_string(),
            }),
            exit: None,
            return_value: None,
            messages: Vec::new(),
            started_at: now,
            ended_at: now,
        };
        self.observer.on_iteration_end(&iteration);
        context.push_iteration(iteration);
    }
}
