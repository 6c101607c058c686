use clap::Parser;
use colored::*;
use eyre::{Context as _, Result};
use log::info;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use codeloop::compiler::{Compiler, ScriptCompiler};
use codeloop::config::{GlobalConfig, load_config};
use codeloop::domain::{Iteration, Trace, TraceSink};
use codeloop::llm::AnthropicClient;
use codeloop::runner::{Context, ExecutionLoop, ExecutionObserver, ExecutionResult, ExecutionStatus};
use codeloop::tools::{ToolError, ToolImplementation};
use codeloop::vm::{VmBackend, VmDriver, VmError, VmExecutionResult, VmOutcome, VmRequest, driver_for};

mod cli;

use cli::Cli;
use cli::commands::Commands;

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("codeloop")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("codeloop.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn format_time(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn describe_trace(trace: &Trace) -> String {
    match trace {
        Trace::Log { message, .. } => message.clone(),
        Trace::Comment { line, comment, .. } => format!("line {}: {}", line, comment),
        Trace::Property {
            object,
            property,
            value,
            ..
        } => format!("{}.{} = {}", object, property, value),
        Trace::ToolCall(call) => {
            let status = if call.success { "ok" } else { "failed" };
            format!("{} ({}, {} ms)", call.tool_name, status, call.ended_at.saturating_sub(call.started_at))
        }
        Trace::ToolSlow {
            tool_name, duration_ms, ..
        } => format!("{} still running after {} ms", tool_name, duration_ms),
        Trace::SignalRaised { signal, .. } => signal.to_string(),
        Trace::AbortSignal { reason, .. } => reason.clone(),
        Trace::CodeExecution { lines_executed, .. } => format!("{} lines executed", lines_executed),
        Trace::CodeExecutionException { message, .. } | Trace::InvalidCodeException { message, .. } => {
            message.clone()
        }
        Trace::LlmCallStarted { model, .. } => model.clone(),
        Trace::LlmCallSuccess {
            input_tokens,
            output_tokens,
            ..
        } => format!("{} in / {} out tokens", input_tokens, output_tokens),
        Trace::Yield { value, .. } => value.to_string(),
    }
}

fn print_trace(trace: &Trace) {
    println!(
        "  {} {:<26} {}",
        format_time(trace.started_at()).dimmed(),
        trace.type_name().cyan(),
        describe_trace(trace)
    );
}

/// Prints traces as they happen
struct TracePrinter;

impl ExecutionObserver for TracePrinter {
    fn on_trace(&self, trace: &Trace) {
        print_trace(trace);
    }

    fn on_iteration_end(&self, iteration: &Iteration) {
        println!("{} {} {}", "Iteration".bold(), iteration.id, iteration.status.as_str());
    }
}

fn parse_vars(vars: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut parsed = BTreeMap::new();
    for var in vars {
        let Some((name, raw)) = var.split_once('=') else {
            eyre::bail!("Invalid --var '{}', expected NAME=JSON", var);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        parsed.insert(name.trim().to_string(), value);
    }
    Ok(parsed)
}

fn print_variables(variables: &BTreeMap<String, Value>) {
    if variables.is_empty() {
        return;
    }
    println!("{}", "Variables:".bold());
    for (name, value) in variables {
        println!("  {} = {}", name.green(), value);
    }
}

fn print_vm_result(result: &VmExecutionResult, traces: &[Trace]) {
    match &result.outcome {
        VmOutcome::Completed { value } => println!("{} {}", "Completed:".green().bold(), value),
        VmOutcome::Suspended { signal } => println!("{} {}", "Suspended:".yellow().bold(), signal),
        VmOutcome::Failed { error } => {
            println!("{} {}", "Failed:".red().bold(), error);
            if let VmError::Execution { stack, .. } | VmError::Assignment { stack, .. } = error {
                println!("{}", stack);
            }
        }
    }
    print_variables(&result.variables);
    if !traces.is_empty() {
        println!("{}", "Traces:".bold());
        traces.iter().for_each(print_trace);
    }
}

async fn handle_run_command(
    script: &PathBuf,
    backend: Option<VmBackend>,
    vars: &[String],
    config: &GlobalConfig,
) -> Result<()> {
    info!("Running script: {}", script.display());
    let source = fs::read_to_string(script).context(format!("Failed to read {}", script.display()))?;
    let compiled = ScriptCompiler::new()
        .compile(&source)
        .map_err(|e| eyre::eyre!("Invalid code in {}: {}", script.display(), e))?;

    let backend = backend.unwrap_or(config.vm.backend);
    let traces = TraceSink::new();
    let request = VmRequest::new(compiled)
        .with_variables(parse_vars(vars)?)
        .with_traces(traces.clone())
        .with_limits(config.vm_limits());

    println!("{} {} ({})", "Running:".cyan(), script.display(), backend);
    let result = driver_for(backend).execute(request).await;
    print_vm_result(&result, &traces.snapshot());

    if result.error().is_some() {
        eyre::bail!("Script failed");
    }
    Ok(())
}

fn handle_check_command(patterns: &[String]) -> Result<()> {
    let compiler = ScriptCompiler::new();
    let mut checked = 0;
    let mut invalid = 0;

    for pattern in patterns {
        let paths = glob::glob(pattern).context(format!("Invalid glob pattern: {}", pattern))?;
        for entry in paths {
            let path = entry.context("Failed to read glob entry")?;
            let source = fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
            checked += 1;
            match compiler.compile(&source) {
                Ok(_) => println!("{} {}", "ok".green(), path.display()),
                Err(e) => {
                    invalid += 1;
                    println!("{} {}: {}", "invalid".red(), path.display(), e);
                }
            }
        }
    }

    if checked == 0 {
        eyre::bail!("No files matched");
    }
    if invalid > 0 {
        eyre::bail!("{} of {} file(s) have invalid code", invalid, checked);
    }
    Ok(())
}

fn builtin_tools() -> Vec<ToolImplementation> {
    vec![
        ToolImplementation::from_sync_fn("current_time", |_| {
            Ok(Value::String(chrono::Local::now().to_rfc3339()))
        })
        .with_description("Current local date and time (RFC 3339)"),
        ToolImplementation::from_fn("read_file", |input, _ctx| async move {
            let Some(path) = input.as_str().map(str::to_string) else {
                return Err(ToolError::failed("read_file expects a path string"));
            };
            tokio::fs::read_to_string(&path)
                .await
                .map(Value::String)
                .map_err(|e| ToolError::failed(format!("Failed to read {}: {}", path, e)))
        })
        .with_description("Read a UTF-8 text file")
        .with_input_schema(serde_json::json!({"type": "string"})),
    ]
}

fn print_execution_result(result: &ExecutionResult) -> Result<()> {
    for iteration in result.iterations() {
        if let Some(error) = &iteration.error {
            println!("  {} {}: {}", iteration.id.dimmed(), iteration.status.as_str(), error);
        }
    }

    match result.status {
        ExecutionStatus::Success => {
            println!("{} after {} iteration(s)", "Success".green().bold(), result.iterations().len());
            if let Some(exit) = result.exit() {
                println!("  exit: {}", exit);
            }
            if let Some(value) = result.return_value() {
                println!("  value: {}", value);
            }
            if let Some(signal) = result.last_iteration().and_then(|i| i.signal.as_ref()) {
                println!("  signal: {}", signal);
            }
        }
        ExecutionStatus::Interrupted => {
            println!("{}", "Interrupted".yellow().bold());
            if let Some(snapshot) = &result.snapshot {
                println!("{}", snapshot.to_json()?);
            }
        }
        ExecutionStatus::Error => {
            let message = result
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            eyre::bail!("Run failed: {}", message);
        }
    }
    Ok(())
}

async fn handle_ask_command(
    instructions: &str,
    script_tools: bool,
    verbose: bool,
    config: &GlobalConfig,
) -> Result<()> {
    info!("Asking: {}", instructions);
    let client = AnthropicClient::new(config.anthropic_config())?;

    let mut context = Context::new(instructions).with_options(config.context_options());
    if script_tools {
        context = context.with_tools(builtin_tools());
    }

    let mut runner = ExecutionLoop::with_config(Arc::new(client), config.execution_config());
    if verbose {
        runner = runner.with_observer(Arc::new(TracePrinter));
    }

    let result = runner.run(context).await;
    print_execution_result(&result)
}

fn handle_config_command(config: &GlobalConfig) -> Result<()> {
    print!("{}", serde_yaml::to_string(config).context("Failed to serialize config")?);
    Ok(())
}

async fn run_application(cli: &Cli, config: &GlobalConfig) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run { script, backend, vars } => handle_run_command(script, *backend, vars, config).await,
        Commands::Check { patterns } => handle_check_command(patterns),
        Commands::Ask {
            instructions,
            script_tools,
        } => handle_ask_command(instructions, *script_tools, cli.is_verbose(), config).await,
        Commands::Config => handle_config_command(config),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
