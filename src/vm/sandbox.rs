//! The sandbox worker
//!
//! [`run`] builds a fresh engine, registers instrumentation hooks, signal
//! built-ins, tools and object bindings, evaluates the script and reads the
//! surviving globals back out of the scope. It runs on a worker thread and
//! talks to the async side only through [`HostChannel`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rhai::{
    Array, Blob, Dynamic, Engine, EvalAltResult, ImmutableString, INT, Map as RhaiMap, Position, Scope,
};
use serde_json::Value;

use super::binding::{HostBinding, ObjectHandle, SealedRecord};
use super::host::{HostChannel, HostReply, HostRequest};
use crate::compiler::CompiledCode;
use crate::domain::{Signal, ToolCallAssignment, Trace, TraceSink};
use crate::id::now_ms;
use crate::objects::ObjectMirror;
use crate::tools::ToolImplementation;

const TIMEOUT_TOKEN: &str = "timeout";
const KILLED_TOKEN: &str = "killed";
const SUSPENDED_TOKEN: &str = "suspended";
const MEMORY_TOKEN: &str = "memory";

/// Variable reads between two scope measurements
const MEMORY_CHECK_INTERVAL: usize = 256;

/// Rough per-value overhead counted by the scope measurement
const VALUE_OVERHEAD: usize = 16;

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Engine size limits for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EngineLimits {
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: Option<usize>,
    pub max_expr_depths: Option<(usize, usize)>,
    /// Ceiling on the estimated size of everything in scope
    pub memory_budget: usize,
}

impl EngineLimits {
    /// Spread a memory budget over string, array and map sizes
    pub fn from_memory(bytes: usize) -> Self {
        Self {
            max_string_size: bytes.max(1),
            max_array_size: (bytes / 64).max(1),
            max_map_size: (bytes / 64).max(1),
            max_call_levels: None,
            max_expr_depths: None,
            memory_budget: bytes.max(1),
        }
    }

    fn apply(&self, engine: &mut Engine) {
        engine.set_max_string_size(self.max_string_size);
        engine.set_max_array_size(self.max_array_size);
        engine.set_max_map_size(self.max_map_size);
        if let Some(levels) = self.max_call_levels {
            engine.set_max_call_levels(levels);
        }
        if let Some((expr, function)) = self.max_expr_depths {
            engine.set_max_expr_depths(expr, function);
        }
    }
}

/// State shared between the worker and the driver
#[derive(Debug, Default)]
pub(crate) struct SandboxState {
    kill: AtomicBool,
    current_line: AtomicU32,
    line_hits: Mutex<BTreeMap<u32, u32>>,
    current_call: Mutex<Option<u32>>,
    var_reads: AtomicUsize,
    suspended: AtomicBool,
    raised_signal: Mutex<Option<Signal>>,
    last_fault: Mutex<Option<String>>,
}

impl SandboxState {
    pub fn kill(&self) {
        self.kill.store(true, Ordering::SeqCst);
    }

    fn is_killed(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }

    fn track_line(&self, line: u32) {
        self.current_line.store(line, Ordering::SeqCst);
        *self
            .line_hits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(line)
            .or_insert(0) += 1;
        *self.current_call.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn track_call(&self, id: u32) {
        *self.current_call.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    /// Take the pending call id only if `accept` agrees it belongs to this call
    fn take_call_if(&self, accept: impl FnOnce(u32) -> bool) -> Option<u32> {
        let mut current = self.current_call.lock().unwrap_or_else(|e| e.into_inner());
        let id = (*current)?;
        if !accept(id) {
            return None;
        }
        current.take()
    }

    /// True once every `interval` variable reads
    fn memory_check_due(&self, interval: usize) -> bool {
        self.var_reads.fetch_add(1, Ordering::Relaxed) % interval == 0
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Last line a statement started on
    pub fn line(&self) -> Option<u32> {
        match self.current_line.load(Ordering::SeqCst) {
            0 => None,
            line => Some(line),
        }
    }

    pub fn line_hits(&self) -> BTreeMap<u32, u32> {
        self.line_hits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record a signal and build the error that unwinds the script
    ///
    /// The first signal wins. The unwind cannot be caught, and nothing runs
    /// after it: later operations and host calls are refused.
    fn raise(&self, signal: Signal) -> Box<EvalAltResult> {
        let mut raised = self.raised_signal.lock().unwrap_or_else(|e| e.into_inner());
        if raised.is_none() {
            *raised = Some(signal);
        }
        self.suspended.store(true, Ordering::SeqCst);
        suspended()
    }

    fn take_signal(&self) -> Option<Signal> {
        self.raised_signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Build the error for a rejected write so it classifies as an assignment
    fn fault(&self, message: String) -> Box<EvalAltResult> {
        *self.last_fault.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.clone());
        EvalAltResult::ErrorRuntime(Dynamic::from(message), Position::NONE).into()
    }

    fn is_fault(&self, message: &str) -> bool {
        self.last_fault
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            == Some(message)
    }
}

/// Everything the worker needs, moved onto its thread
pub(crate) struct SandboxJob<B> {
    pub binding: B,
    pub compiled: CompiledCode,
    pub variables: BTreeMap<String, Value>,
    pub tools: Vec<ToolImplementation>,
    pub mirrors: Vec<ObjectMirror>,
    pub limits: EngineLimits,
    pub deadline: Instant,
    pub state: Arc<SandboxState>,
    pub host: HostChannel,
    pub traces: TraceSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    Execution,
    Assignment,
    Timeout,
    Memory,
    Killed,
}

/// A failure with positions still in instrumented coordinates
#[derive(Debug, Clone)]
pub(crate) struct RawFailure {
    pub kind: FailureKind,
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

#[derive(Debug, Clone)]
pub(crate) enum RawOutcome {
    Completed(Value),
    Suspended(Signal),
    Failed(RawFailure),
}

#[derive(Debug, Clone)]
pub(crate) struct SandboxReport {
    pub outcome: RawOutcome,
    pub variables: BTreeMap<String, Value>,
}

/// Host-call plumbing captured by registered functions
#[derive(Clone)]
struct Bridge<B> {
    binding: B,
    host: HostChannel,
    state: Arc<SandboxState>,
    tool_calls: Arc<BTreeMap<u32, ToolCallAssignment>>,
}

impl<B: HostBinding> Bridge<B> {
    fn call_tool(
        &self,
        tool: &ToolImplementation,
        object: Option<String>,
        input: &Dynamic,
    ) -> RhaiResult<Dynamic> {
        if self.state.is_suspended() {
            return Err(suspended());
        }
        let assignment = self
            .state
            .take_call_if(|id| {
                self.tool_calls
                    .get(&id)
                    .is_some_and(|a| tool.matches(a.callee.rsplit('.').next().unwrap_or(&a.callee)))
            })
            .and_then(|id| self.tool_calls.get(&id).cloned());
        let request = HostRequest::Tool {
            tool: tool.clone(),
            object,
            input: self.binding.from_sandbox(input),
            assignment,
            line: self.state.line(),
        };
        match self.host.call(request) {
            Some(HostReply::Value(value)) => Ok(self.binding.to_sandbox(&value)),
            Some(HostReply::Signal(signal)) => Err(self.state.raise(signal)),
            Some(HostReply::Error(message)) => Err(runtime_error(message)),
            None => Err(terminated()),
        }
    }

    fn yield_value(&self, value: &Dynamic) -> RhaiResult<()> {
        if self.state.is_suspended() {
            return Err(suspended());
        }
        let request = HostRequest::Yield {
            value: self.binding.from_sandbox(value),
        };
        match self.host.call(request) {
            Some(_) => Ok(()),
            None => Err(terminated()),
        }
    }

    /// Raise a signal from a built-in and record it as a trace
    fn signal(&self, traces: &TraceSink, signal: Signal) -> Box<EvalAltResult> {
        if self.state.is_suspended() {
            return suspended();
        }
        traces.push(Trace::signal(signal.clone(), self.state.line()));
        self.state.raise(signal)
    }
}

fn terminated() -> Box<EvalAltResult> {
    stop(KILLED_TOKEN)
}

fn suspended() -> Box<EvalAltResult> {
    stop(SUSPENDED_TOKEN)
}

/// Uncatchable unwind carrying `token`
fn stop(token: &str) -> Box<EvalAltResult> {
    EvalAltResult::ErrorTerminated(Dynamic::from(token.to_string()), Position::NONE).into()
}

fn runtime_error(message: String) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message), Position::NONE).into()
}

/// Estimated bytes held by a sandbox value
fn estimate_size(value: &Dynamic) -> usize {
    if let Some(s) = value.read_lock::<ImmutableString>() {
        return VALUE_OVERHEAD + s.len();
    }
    if let Some(array) = value.read_lock::<Array>() {
        return VALUE_OVERHEAD + array.iter().map(estimate_size).sum::<usize>();
    }
    if let Some(map) = value.read_lock::<RhaiMap>() {
        return VALUE_OVERHEAD
            + map
                .iter()
                .map(|(k, v)| k.len() + estimate_size(v))
                .sum::<usize>();
    }
    if let Some(blob) = value.read_lock::<Blob>() {
        return VALUE_OVERHEAD + blob.len();
    }
    if let Some(record) = value.read_lock::<SealedRecord>() {
        return VALUE_OVERHEAD + record.to_value().to_string().len();
    }
    VALUE_OVERHEAD
}

fn scope_size(scope: &Scope) -> usize {
    scope.iter_raw().map(|(_, _, value)| estimate_size(value)).sum()
}

/// Placeholder type behind the `console` global
#[derive(Debug, Clone, Copy)]
struct Console;

/// Run one script to completion on the current thread
pub(crate) fn run<B: HostBinding>(job: SandboxJob<B>) -> SandboxReport {
    let SandboxJob {
        binding,
        compiled,
        variables,
        tools,
        mirrors,
        limits,
        deadline,
        state,
        host,
        traces,
    } = job;

    let mut engine = Engine::new();
    limits.apply(&mut engine);

    let bridge = Bridge {
        binding,
        host,
        state: state.clone(),
        tool_calls: Arc::new(compiled.tool_calls.clone()),
    };

    register_hooks(&mut engine, &bridge, &traces, deadline, limits.memory_budget);
    register_signals(&mut engine, &bridge, &traces);
    register_console(&mut engine, binding, &traces);
    register_tools(&mut engine, &bridge, &tools);
    register_objects(&mut engine, &bridge, &mirrors);
    register_records(&mut engine, &bridge);

    let mut scope = Scope::new();
    let mut hidden = BTreeSet::new();
    for (name, value) in &variables {
        scope.push_dynamic(name.clone(), binding.to_global(name, value));
    }
    for mirror in &mirrors {
        scope.push(mirror.name().to_string(), ObjectHandle::new(mirror.clone()));
        hidden.insert(mirror.name().to_string());
    }
    scope.push("console", Console);
    hidden.insert("console".to_string());

    let result = match engine.compile(&compiled.code) {
        Ok(ast) => engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast),
        Err(err) => {
            let failure = RawFailure {
                kind: FailureKind::Execution,
                message: err.0.to_string(),
                line: err.1.line().map(|l| l as u32),
                column: err.1.position().map(|c| c as u32),
            };
            return SandboxReport {
                outcome: RawOutcome::Failed(failure),
                variables: BTreeMap::new(),
            };
        }
    };

    let collected = collect_variables(&scope, binding, &hidden);
    let signal = state.take_signal();

    let outcome = match (result, signal) {
        (_, Some(signal)) => RawOutcome::Suspended(signal),
        (Err(err), None) if is_termination(&err) => RawOutcome::Failed(classify(*err, &state)),
        (Ok(value), None) => RawOutcome::Completed(binding.from_sandbox(&value)),
        (Err(err), None) => RawOutcome::Failed(classify(*err, &state)),
    };

    SandboxReport {
        outcome,
        variables: collected,
    }
}

fn register_hooks<B: HostBinding>(
    engine: &mut Engine,
    bridge: &Bridge<B>,
    traces: &TraceSink,
    deadline: Instant,
    memory_budget: usize,
) {
    let state = bridge.state.clone();
    engine.on_progress(move |ops| {
        if state.is_killed() {
            return Some(Dynamic::from(KILLED_TOKEN.to_string()));
        }
        if state.is_suspended() {
            return Some(Dynamic::from(SUSPENDED_TOKEN.to_string()));
        }
        if ops % 64 == 0 && Instant::now() >= deadline {
            return Some(Dynamic::from(TIMEOUT_TOKEN.to_string()));
        }
        None
    });

    // Whole-scope size, sampled on variable reads
    let state = bridge.state.clone();
    engine.on_var(move |_name, _index, context| {
        if state.memory_check_due(MEMORY_CHECK_INTERVAL) && scope_size(context.scope()) > memory_budget {
            return Err(stop(MEMORY_TOKEN));
        }
        Ok(None)
    });

    let sink = traces.clone();
    engine.on_print(move |text| sink.push(Trace::log(text, Vec::new())));
    let sink = traces.clone();
    engine.on_debug(move |text, _source, _pos| sink.push(Trace::log(text, Vec::new())));

    let state = bridge.state.clone();
    engine.register_fn("__track_line", move |line: INT| {
        state.track_line(line as u32);
    });

    let state = bridge.state.clone();
    engine.register_fn("__track_tool_call", move |id: INT| {
        state.track_call(id as u32);
    });

    let sink = traces.clone();
    engine.register_fn("__record_comment", move |text: ImmutableString, line: INT| {
        sink.push(Trace::Comment {
            started_at: now_ms(),
            line: line as u32,
            comment: text.to_string(),
        });
    });

    let b = bridge.clone();
    engine.register_fn("__yield", move |value: Dynamic| b.yield_value(&value));
}

fn register_signals<B: HostBinding>(engine: &mut Engine, bridge: &Bridge<B>, traces: &TraceSink) {
    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn("think", move || -> RhaiResult<()> {
        Err(b.signal(&t, Signal::think("Script asked to think")))
    });
    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn("think", move |reason: ImmutableString| -> RhaiResult<()> {
        Err(b.signal(&t, Signal::think(reason.as_str())))
    });
    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn(
        "think",
        move |reason: ImmutableString, context: Dynamic| -> RhaiResult<()> {
            let signal = Signal::Think(crate::domain::ThinkSignal {
                reason: reason.to_string(),
                context: Some(b.binding.from_sandbox(&context)),
            });
            Err(b.signal(&t, signal))
        },
    );

    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn("listen", move || -> RhaiResult<()> {
        Err(b.signal(&t, Signal::listen()))
    });
    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn("listen", move |reason: ImmutableString| -> RhaiResult<()> {
        let signal = Signal::Listen(crate::domain::ListenSignal {
            reason: Some(reason.to_string()),
        });
        Err(b.signal(&t, signal))
    });

    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn("transition", move |target: ImmutableString| -> RhaiResult<()> {
        Err(b.signal(&t, Signal::transition(target.as_str())))
    });
    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn(
        "transition",
        move |target: ImmutableString, reason: ImmutableString| -> RhaiResult<()> {
            let signal = Signal::Transition(crate::domain::TransitionSignal {
                target: target.to_string(),
                reason: Some(reason.to_string()),
            });
            Err(b.signal(&t, signal))
        },
    );

    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn("execute", move |target: ImmutableString| -> RhaiResult<()> {
        Err(b.signal(&t, Signal::execute(target.as_str(), Value::Null)))
    });
    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn(
        "execute",
        move |target: ImmutableString, input: Dynamic| -> RhaiResult<()> {
            let input = b.binding.from_sandbox(&input);
            Err(b.signal(&t, Signal::execute(target.as_str(), input)))
        },
    );

    let (b, t) = (bridge.clone(), traces.clone());
    engine.register_fn("interrupt", move |reason: ImmutableString| -> RhaiResult<()> {
        Err(b.signal(&t, Signal::interrupt(reason.as_str())))
    });
}

fn register_console<B: HostBinding>(engine: &mut Engine, binding: B, traces: &TraceSink) {
    engine.register_type_with_name::<Console>("Console");

    fn render<B: HostBinding>(binding: B, value: &Dynamic) -> String {
        match binding.from_sandbox(value) {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }

    for method in ["log", "info", "warn", "error"] {
        let sink = traces.clone();
        engine.register_fn(method, move |_: &mut Console, message: Dynamic| {
            sink.push(Trace::log(render(binding, &message), Vec::new()));
        });
        let sink = traces.clone();
        engine.register_fn(method, move |_: &mut Console, message: Dynamic, a: Dynamic| {
            let args = vec![binding.from_sandbox(&a)];
            sink.push(Trace::log(render(binding, &message), args));
        });
        let sink = traces.clone();
        engine.register_fn(
            method,
            move |_: &mut Console, message: Dynamic, a: Dynamic, b: Dynamic| {
                let args = vec![binding.from_sandbox(&a), binding.from_sandbox(&b)];
                sink.push(Trace::log(render(binding, &message), args));
            },
        );
    }
}

fn register_tools<B: HostBinding>(
    engine: &mut Engine,
    bridge: &Bridge<B>,
    tools: &[ToolImplementation],
) {
    for tool in tools {
        for name in tool.names() {
            let (b, t) = (bridge.clone(), tool.clone());
            engine.register_fn(name, move || b.call_tool(&t, None, &Dynamic::UNIT));
            let (b, t) = (bridge.clone(), tool.clone());
            engine.register_fn(name, move |input: Dynamic| b.call_tool(&t, None, &input));
        }
    }
}

fn register_objects<B: HostBinding>(
    engine: &mut Engine,
    bridge: &Bridge<B>,
    mirrors: &[ObjectMirror],
) {
    engine.register_type_with_name::<ObjectHandle>("Object");

    let binding = bridge.binding;
    engine.register_indexer_get(
        move |handle: &mut ObjectHandle, key: ImmutableString| -> RhaiResult<Dynamic> {
            handle
                .mirror()
                .get(&key)
                .map(|value| binding.to_sandbox(&value))
                .map_err(|e| runtime_error(e.to_string()))
        },
    );

    let (binding, state) = (bridge.binding, bridge.state.clone());
    engine.register_indexer_set(
        move |handle: &mut ObjectHandle, key: ImmutableString, value: Dynamic| -> RhaiResult<()> {
            handle
                .mirror()
                .set(&key, binding.from_sandbox(&value))
                .map(|_| ())
                .map_err(|e| state.fault(e.to_string()))
        },
    );

    let binding = bridge.binding;
    engine.register_fn("to_string", move |handle: &mut ObjectHandle| -> String {
        binding.from_sandbox(&Dynamic::from(handle.clone())).to_string()
    });

    let methods: BTreeSet<String> = mirrors
        .iter()
        .flat_map(|m| m.tools().iter().flat_map(|t| t.names().map(str::to_string)))
        .collect();

    for method in methods {
        let (b, name) = (bridge.clone(), method.clone());
        engine.register_fn(method.as_str(), move |handle: &mut ObjectHandle| {
            call_method(&b, handle, &name, &Dynamic::UNIT)
        });
        let (b, name) = (bridge.clone(), method.clone());
        engine.register_fn(method.as_str(), move |handle: &mut ObjectHandle, input: Dynamic| {
            call_method(&b, handle, &name, &input)
        });
    }
}

fn call_method<B: HostBinding>(
    bridge: &Bridge<B>,
    handle: &ObjectHandle,
    name: &str,
    input: &Dynamic,
) -> RhaiResult<Dynamic> {
    let mirror = handle.mirror();
    let Some(tool) = mirror.tool(name).cloned() else {
        return Err(runtime_error(format!("Object {} has no tool {}", mirror.name(), name)));
    };
    bridge.call_tool(&tool, Some(mirror.name().to_string()), input)
}

fn register_records<B: HostBinding>(engine: &mut Engine, bridge: &Bridge<B>) {
    engine.register_type_with_name::<SealedRecord>("Record");

    let binding = bridge.binding;
    engine.register_indexer_get(
        move |record: &mut SealedRecord, key: ImmutableString| -> Dynamic {
            record
                .get(&key)
                .map(|value| binding.to_sandbox(&value))
                .unwrap_or(Dynamic::UNIT)
        },
    );

    let (binding, state) = (bridge.binding, bridge.state.clone());
    engine.register_indexer_set(
        move |record: &mut SealedRecord, key: ImmutableString, value: Dynamic| -> RhaiResult<()> {
            record
                .set(&key, binding.from_sandbox(&value))
                .map_err(|e| state.fault(e.to_string()))
        },
    );

    engine.register_fn("keys", |record: &mut SealedRecord| -> rhai::Array {
        record.keys().into_iter().map(Dynamic::from).collect()
    });
    engine.register_fn("len", |record: &mut SealedRecord| record.len() as INT);
    engine.register_fn("contains", |record: &mut SealedRecord, key: ImmutableString| {
        record.contains(&key)
    });
    let binding = bridge.binding;
    engine.register_fn("to_map", move |record: &mut SealedRecord| {
        binding.to_sandbox(&record.to_value())
    });
    engine.register_fn("to_string", |record: &mut SealedRecord| -> String {
        record.to_value().to_string()
    });
}

fn collect_variables<B: HostBinding>(
    scope: &Scope,
    binding: B,
    hidden: &BTreeSet<String>,
) -> BTreeMap<String, Value> {
    let mut variables = BTreeMap::new();
    for (name, _constant, value) in scope.iter() {
        if hidden.contains(name) || binding.is_function(&value) {
            continue;
        }
        variables.insert(name.to_string(), binding.from_sandbox(&value));
    }
    variables
}

fn unwrap_nested(err: EvalAltResult) -> EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => unwrap_nested(*inner),
        other => other,
    }
}

fn is_termination(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_termination(inner),
        _ => false,
    }
}

fn classify(err: EvalAltResult, state: &SandboxState) -> RawFailure {
    let mut err = unwrap_nested(err);
    let position = err.take_position();
    let line = position.line().map(|l| l as u32).or_else(|| state.line());
    let column = position.position().map(|c| c as u32);

    let (kind, message) = match &err {
        EvalAltResult::ErrorTerminated(token, _) => match token.to_string().as_str() {
            TIMEOUT_TOKEN => (FailureKind::Timeout, "Execution timed out".to_string()),
            MEMORY_TOKEN => (FailureKind::Memory, "Memory limit exceeded".to_string()),
            _ => (FailureKind::Killed, "Execution was stopped".to_string()),
        },
        EvalAltResult::ErrorDataTooLarge(what, _) => {
            (FailureKind::Memory, format!("{} exceeds the memory limit", what))
        }
        EvalAltResult::ErrorRuntime(value, _) => {
            let message = value.to_string();
            if state.is_fault(&message) {
                (FailureKind::Assignment, message)
            } else {
                (FailureKind::Execution, message)
            }
        }
        other => (FailureKind::Execution, other.to_string()),
    };

    RawFailure {
        kind,
        message,
        line,
        column,
    }
}
