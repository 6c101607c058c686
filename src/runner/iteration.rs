//! Iteration executor
//!
//! One model call, one compile and one execution. The executor builds the
//! message window, asks the model for code, runs it and turns the outcome
//! into an [`Iteration`], queueing corrective messages on the context when
//! the next iteration needs them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::context::Context;
use super::observer::ExecutionObserver;
use crate::abort::AbortSignal;
use crate::compiler::{CompiledCode, Compiler};
use crate::domain::{
    ExecuteSignal, Iteration, IterationError, IterationStatus, ListenSignal, LlmCallMetadata,
    Signal, ThinkSignal, Trace, TraceSink, TransitionSignal,
};
use crate::error::{CodeloopError, Result};
use crate::id::now_ms;
use crate::llm::{GenerateRequest, LlmClient, Message, ResponseFormat, Role, truncate_wrapped};
use crate::protocol::ResponseKind;
use crate::vm::{VmDriver, VmError, VmExecutionResult, VmLimits, VmOutcome, VmRequest};

/// Smallest token buffer kept free for the response
const MIN_BUFFER_TOKENS: usize = 1_000;

/// Largest token buffer kept free for the response
const MAX_BUFFER_TOKENS: usize = 16_000;

/// Reason given to a think with no explicit reason
const IMPLICIT_THINK_REASON: &str = "Code ran but reached no final action";

/// Token budget for the message window of a model with `context_size`
pub fn window_budget(context_size: usize) -> usize {
    let buffer = (context_size / 10).clamp(MIN_BUFFER_TOKENS, MAX_BUFFER_TOKENS);
    context_size.saturating_sub(buffer)
}

/// An iteration plus the error that must end the run, if any
#[derive(Debug)]
pub struct IterationOutcome {
    pub iteration: Iteration,
    pub fatal: Option<CodeloopError>,
}

/// What a script's return value asked for
#[derive(Debug, Clone, PartialEq)]
enum Returned {
    Signal(Signal),
    Exit { action: String, value: Value },
    Invalid { action: String, message: String },
    Nothing,
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Classify a completed script's return value
fn classify_return(value: &Value) -> Returned {
    let (action, map) = match value {
        Value::String(action) => (action.clone(), Map::new()),
        Value::Object(map) => match map.get("action").and_then(Value::as_str) {
            Some(action) => (action.to_string(), map.clone()),
            None => return Returned::Nothing,
        },
        _ => return Returned::Nothing,
    };

    match action.to_lowercase().as_str() {
        "think" => {
            let context: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| k.as_str() != "action" && k.as_str() != "reason")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Returned::Signal(Signal::Think(ThinkSignal {
                reason: string_field(&map, "reason").unwrap_or_else(|| "Thinking".to_string()),
                context: (!context.is_empty()).then_some(Value::Object(context)),
            }))
        }
        "listen" => Returned::Signal(Signal::Listen(ListenSignal {
            reason: string_field(&map, "reason"),
        })),
        "transition" => match string_field(&map, "target") {
            Some(target) => Returned::Signal(Signal::Transition(TransitionSignal {
                target,
                reason: string_field(&map, "reason"),
            })),
            None => Returned::Invalid {
                action,
                message: "a transition needs a \"target\"".to_string(),
            },
        },
        "execute" => match string_field(&map, "target") {
            Some(target) => Returned::Signal(Signal::Execute(ExecuteSignal {
                target,
                input: map.get("input").cloned().unwrap_or(Value::Null),
            })),
            None => Returned::Invalid {
                action,
                message: "an execute needs a \"target\"".to_string(),
            },
        },
        _ => Returned::Exit {
            value: map.get("value").cloned().unwrap_or(Value::Null),
            action,
        },
    }
}

/// Runs exactly one model-call, compile, execute and classify cycle
pub struct IterationExecutor<L: LlmClient> {
    llm: Arc<L>,
    compiler: Arc<dyn Compiler>,
    vm: Arc<dyn VmDriver>,
    limits: VmLimits,
    max_tokens: Option<u32>,
}

impl<L: LlmClient> IterationExecutor<L> {
    pub fn new(llm: Arc<L>, compiler: Arc<dyn Compiler>, vm: Arc<dyn VmDriver>) -> Self {
        Self {
            llm,
            compiler,
            vm,
            limits: VmLimits::default(),
            max_tokens: None,
        }
    }

    pub fn with_limits(mut self, limits: VmLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Run one iteration against `context`
    ///
    /// The iteration is always returned so it can be appended to history,
    /// even when the run cannot continue.
    pub async fn execute(
        &self,
        context: &mut Context,
        abort: &AbortSignal,
        observer: Arc<dyn ExecutionObserver>,
    ) -> IterationOutcome {
        let id = context.begin_iteration();
        let traces = TraceSink::new().with_listener(move |trace| observer.on_trace(trace));
        let mut iteration = Iteration {
            id,
            code: None,
            status: IterationStatus::Success,
            variables: BTreeMap::new(),
            signal: None,
            mutations: Vec::new(),
            llm: None,
            traces: Vec::new(),
            error: None,
            exit: None,
            return_value: None,
            messages: Vec::new(),
            started_at: now_ms(),
            ended_at: 0,
        };

        if let Some(correlation) = context.take_correlation() {
            traces.push(Trace::signal(correlation, None));
        }

        let fatal = self
            .cycle(context, &mut iteration, &traces, abort)
            .await
            .err();
        if let Some(error) = &fatal {
            iteration.status = IterationStatus::Error;
            iteration.error = Some(IterationError::Generation {
                message: error.to_string(),
            });
        }

        iteration.traces = traces.snapshot();
        iteration.ended_at = now_ms();
        IterationOutcome { iteration, fatal }
    }

    async fn cycle(
        &self,
        context: &mut Context,
        iteration: &mut Iteration,
        traces: &TraceSink,
        abort: &AbortSignal,
    ) -> Result<()> {
        let messages = self.message_window(context)?;
        iteration.messages = messages.clone();

        let raw = self.generate(context, messages, iteration, traces).await?;
        let parsed = context.protocol().parse_response(&raw);
        if parsed.kind != ResponseKind::Code {
            return Err(CodeloopError::Protocol(
                "The model response did not contain any code".to_string(),
            ));
        }
        let code = parsed.code;
        iteration.code = Some(code.clone());

        let compiled = match self.compiler.compile(&code) {
            Ok(compiled) => compiled,
            Err(e) => {
                log::debug!("Iteration {} produced invalid code: {}", iteration.id, e);
                traces.push(Trace::InvalidCodeException {
                    started_at: now_ms(),
                    message: e.to_string(),
                    code: code.clone(),
                });
                let protocol = context.protocol();
                let feedback = [
                    protocol.assistant_message(&code),
                    protocol.invalid_code_message(&code, &e.to_string()),
                ];
                context.push_messages(feedback);
                iteration.status = IterationStatus::Error;
                iteration.error = Some(IterationError::InvalidCode {
                    message: e.to_string(),
                });
                return Ok(());
            }
        };

        let request = VmRequest::new(compiled.clone())
            .with_variables(context.variables.clone())
            .with_tools(context.tools().to_vec())
            .with_objects(context.objects().to_vec())
            .with_traces(traces.clone())
            .with_abort(abort.clone())
            .with_limits(self.limits);
        let result = self.vm.execute(request).await;

        context.reconcile(&result.mutations);
        iteration.mutations = result.mutations.clone();
        iteration.variables = result.variables.clone();

        self.classify(context, iteration, traces, &compiled, result);
        Ok(())
    }

    /// System and initial user messages followed by pending feedback,
    /// truncated to the model's context window
    fn message_window(&self, context: &Context) -> Result<Vec<Message>> {
        let protocol = context.protocol();
        let inputs = context.prompt_inputs();
        let mut messages = vec![
            protocol.system_message(&inputs)?,
            protocol.initial_user_message(&inputs)?,
        ];
        messages.extend(context.pending_messages().iter().cloned());

        let details = self.llm.model_details(&context.options.model);
        let truncated = truncate_wrapped(&messages, window_budget(details.context_size))?;
        Ok(truncated
            .into_iter()
            .filter(|m| !m.content.trim().is_empty())
            .collect())
    }

    async fn generate(
        &self,
        context: &Context,
        messages: Vec<Message>,
        iteration: &mut Iteration,
        traces: &TraceSink,
    ) -> Result<String> {
        let (system, rest): (Vec<Message>, Vec<Message>) =
            messages.into_iter().partition(|m| m.role == Role::System);
        let system_prompt = system
            .into_iter()
            .map(|m| m.content)
            .collect::<Vec<_>>()
            .join("\n\n");

        let model = context.options.model.clone();
        let mut request = GenerateRequest::new(model.clone())
            .with_system_prompt(system_prompt)
            .with_messages(rest)
            .with_temperature(context.options.temperature)
            .with_stop_sequences(context.protocol().stop_sequences());
        request.response_format = ResponseFormat::Text;
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let started_at = now_ms();
        traces.push(Trace::LlmCallStarted {
            started_at,
            model: model.clone(),
        });
        let response = self.llm.generate(request).await?;
        let ended_at = now_ms();
        traces.push(Trace::LlmCallSuccess {
            started_at,
            ended_at,
            model: response.model.clone(),
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        });

        let output = response.text().unwrap_or_default().to_string();
        iteration.llm = Some(LlmCallMetadata {
            id: response.id.clone(),
            model: response.model.clone(),
            started_at,
            ended_at,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            cost: response.cost,
            cached: response.cached,
            output: output.clone(),
        });
        Ok(output)
    }

    fn classify(
        &self,
        context: &mut Context,
        iteration: &mut Iteration,
        traces: &TraceSink,
        compiled: &CompiledCode,
        result: VmExecutionResult,
    ) {
        let code = compiled.source.as_str();
        let assigned: BTreeMap<String, Value> = result
            .variables
            .iter()
            .filter(|(name, _)| compiled.variables.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        context
            .variables
            .extend(result.variables.iter().map(|(k, v)| (k.clone(), v.clone())));

        match result.outcome {
            VmOutcome::Failed { error } => self.fail(context, iteration, code, error),
            VmOutcome::Suspended { signal } => {
                self.signal(context, iteration, code, signal, &assigned)
            }
            VmOutcome::Completed { value } => match classify_return(&value) {
                Returned::Signal(signal) => {
                    traces.push(Trace::signal(signal.clone(), None));
                    self.signal(context, iteration, code, signal, &assigned);
                }
                Returned::Exit { action, value } => {
                    self.exit(context, iteration, code, action, value)
                }
                Returned::Invalid { action, message } => {
                    self.invalid_return(context, iteration, code, action, message)
                }
                Returned::Nothing => {
                    let think = Signal::think(IMPLICIT_THINK_REASON);
                    self.signal(context, iteration, code, think, &assigned);
                }
            },
        }
    }

    fn signal(
        &self,
        context: &mut Context,
        iteration: &mut Iteration,
        code: &str,
        signal: Signal,
        assigned: &BTreeMap<String, Value>,
    ) {
        if let Signal::Think(think) = &signal {
            let executed = !assigned.is_empty()
                || think.context_len() > 0
                || context.protocol().reports_code_executed();
            if executed {
                if let Some(Value::Object(carried)) = &think.context {
                    context
                        .variables
                        .extend(carried.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                let protocol = context.protocol();
                let feedback = [
                    protocol.assistant_message(code),
                    protocol.thinking_message(think),
                ];
                context.push_messages(feedback);
                iteration.status = IterationStatus::Partial;
            } else {
                log::debug!("Iteration {} thought without assignments", iteration.id);
                iteration.status = IterationStatus::Success;
            }
        } else {
            iteration.status = IterationStatus::Success;
        }
        iteration.signal = Some(signal);
    }

    fn exit(
        &self,
        context: &mut Context,
        iteration: &mut Iteration,
        code: &str,
        action: String,
        value: Value,
    ) {
        if context.exits().is_empty() {
            iteration.exit = Some(action);
            iteration.return_value = Some(value);
            iteration.status = IterationStatus::Success;
            return;
        }

        let Some(exit) = context.exits().iter().find(|e| e.matches(&action)) else {
            let names: Vec<&str> = context.exits().iter().map(|e| e.name.as_str()).collect();
            let message = format!("unknown exit, expected one of: {}", names.join(", "));
            return self.invalid_return(context, iteration, code, action, message);
        };

        match exit.parse_value(&value) {
            Ok(parsed) => {
                iteration.exit = Some(exit.name.clone());
                iteration.return_value = Some(parsed);
                iteration.status = IterationStatus::Success;
            }
            Err(e) => self.invalid_return(context, iteration, code, action, e.to_string()),
        }
    }

    fn invalid_return(
        &self,
        context: &mut Context,
        iteration: &mut Iteration,
        code: &str,
        action: String,
        message: String,
    ) {
        let error = IterationError::Exit { action, message };
        let protocol = context.protocol();
        let feedback = [
            protocol.assistant_message(code),
            protocol.invalid_code_message(code, &error.to_string()),
        ];
        context.push_messages(feedback);
        iteration.status = IterationStatus::Error;
        iteration.error = Some(error);
    }

    fn fail(&self, context: &mut Context, iteration: &mut Iteration, code: &str, error: VmError) {
        let (recorded, stack) = match error {
            VmError::Execution { message, stack, .. } => (
                IterationError::CodeExecution {
                    message,
                    stack: stack.clone(),
                },
                stack,
            ),
            VmError::Assignment { message, stack, .. } => (
                IterationError::Assignment {
                    message,
                    stack: stack.clone(),
                },
                stack,
            ),
            VmError::Timeout { timeout_ms } => {
                (IterationError::Timeout { timeout_ms }, String::new())
            }
            VmError::MemoryLimit { limit_bytes, .. } => {
                (IterationError::MemoryLimit { limit_bytes }, String::new())
            }
            VmError::Aborted { reason } => (IterationError::Aborted { reason }, String::new()),
        };

        if !matches!(recorded, IterationError::Aborted { .. }) {
            let protocol = context.protocol();
            let feedback = [
                protocol.assistant_message(code),
                protocol.execution_error_message(&recorded.to_string(), &stack),
            ];
            context.push_messages(feedback);
        }
        iteration.status = IterationStatus::Error;
        iteration.error = Some(recorded);
    }
}
