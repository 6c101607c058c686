//! Execution loop integration tests
//!
//! Drives full runs through the public API with a mock LLM client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use codeloop::CodeloopError;
use codeloop::domain::{Exit, IterationError, IterationStatus, Signal, trace_types};
use codeloop::llm::MockLlmClient;
use codeloop::objects::{ObjectInstance, ObjectProperty};
use codeloop::runner::{Context, ContextOptions, ExecutionConfig, ExecutionLoop};
use codeloop::snapshot::{Snapshot, SnapshotStatus};
use codeloop::tools::{ToolError, ToolImplementation};
use codeloop::vm::VmBackend;
use serde_json::json;

fn runner(llm: &Arc<MockLlmClient>) -> ExecutionLoop<MockLlmClient> {
    ExecutionLoop::new(llm.clone())
}

/// Integration test: a single valid response finishes the run
#[tokio::test]
async fn test_single_iteration_success() {
    let llm = Arc::new(MockLlmClient::new(vec![
        "let a = 1 + 1;\nreturn #{ action: \"respond\", value: a };",
    ]));
    let result = runner(&llm).run(Context::new("add numbers")).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.iterations().len(), 1);
    let iteration = result.last_iteration().unwrap();
    assert_eq!(iteration.status, IterationStatus::Success);
    assert_eq!(iteration.variables["a"], json!(2));
    assert_eq!(result.context.variables["a"], json!(2));
    assert!(iteration.llm.is_some());
    assert_eq!(iteration.traces_of(trace_types::LLM_CALL_STARTED).len(), 1);
}

/// Integration test: invalid code is reported back and the next response recovers
#[tokio::test]
async fn test_invalid_code_then_recovery() {
    let llm = Arc::new(MockLlmClient::new(vec![
        "let = ;",
        "let ok = true;\nreturn #{ action: \"respond\", value: ok };",
    ]));
    let result = runner(&llm).run(Context::new("")).await;

    assert!(result.is_success());
    assert_eq!(result.iterations().len(), 2);
    let first = &result.iterations()[0];
    assert_eq!(first.status, IterationStatus::Error);
    assert!(matches!(first.error, Some(IterationError::InvalidCode { .. })));
    assert_eq!(first.traces_of(trace_types::INVALID_CODE_EXCEPTION).len(), 1);

    let second_request = &llm.requests()[1];
    assert!(second_request.messages.iter().any(|m| m.content.contains("let = ;")));
}

/// Integration test: interrupt, persist the snapshot as JSON, resolve and continue
#[tokio::test]
async fn test_interrupt_snapshot_resume() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let approve = ToolImplementation::from_sync_fn("requestApproval", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::Signal(Signal::interrupt("manager approval required")))
    });
    let llm = Arc::new(MockLlmClient::new(vec![
        "let amount = 250;\nlet approved = requestApproval(amount);\nreturn #{ action: \"done\", value: approved };",
        "return #{ action: \"done\", value: approved };",
    ]));
    let runner = runner(&llm);

    let result = runner.run(Context::new("refund").with_tool(approve)).await;
    assert!(result.is_interrupted());
    assert!(result.signal.as_ref().is_some_and(Signal::is_interrupt));

    let json = result.snapshot.as_ref().unwrap().to_json().unwrap();
    let snapshot = Snapshot::from_json(&json).unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Pending);
    assert_eq!(snapshot.variables["amount"], json!(250));
    assert_eq!(snapshot.tool_call().unwrap().name, "requestApproval");

    let resumed = runner.resolve(result.context, snapshot, json!("yes")).await;
    assert!(resumed.is_success(), "{:?}", resumed.error);
    assert_eq!(resumed.exit(), Some("done"));
    assert_eq!(resumed.return_value(), Some(&json!("yes")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(resumed.iterations().len(), 2);
}

/// Integration test: a script that keeps thinking runs out of iterations
#[tokio::test]
async fn test_loop_limit_exceeded() {
    let llm = Arc::new(MockLlmClient::new(vec!["let seen = 1;\nthink(\"more\");"]));
    let context = Context::new("").with_options(ContextOptions::default().with_loop_limit(1));
    let result = runner(&llm).run(context).await;

    assert!(result.is_error());
    assert!(matches!(result.error, Some(CodeloopError::LoopExceeded(1))));
    assert_eq!(result.iterations().len(), 1);
    assert_eq!(result.iterations()[0].status, IterationStatus::Partial);
}

/// Integration test: think with nothing assigned does not ask for another turn
#[tokio::test]
async fn test_think_without_assignments_succeeds() {
    let llm = Arc::new(MockLlmClient::new(vec!["think(\"nothing new\");"]));
    let result = runner(&llm).run(Context::new("")).await;

    assert!(result.is_success());
    assert_eq!(result.iterations().len(), 1);
    assert_eq!(result.iterations()[0].status, IterationStatus::Success);
    assert_eq!(llm.call_count(), 1);
}

/// Integration test: think after assigning continues with the new variables
#[tokio::test]
async fn test_think_with_assignments_continues() {
    let llm = Arc::new(MockLlmClient::new(vec![
        "let total = 3 * 7;\nthink(\"check total\");",
        "return #{ action: \"respond\", value: total };",
    ]));
    let result = runner(&llm).run(Context::new("")).await;

    assert!(result.is_success());
    assert_eq!(result.iterations()[0].status, IterationStatus::Partial);
    assert_eq!(result.return_value(), Some(&json!(21)));
    let sent = &llm.requests()[1].messages;
    assert!(sent.iter().any(|m| m.content.contains("total")));
}

/// Integration test: an exit value that breaks its schema is retried
#[tokio::test]
async fn test_exit_schema_violation_is_retried() {
    let llm = Arc::new(MockLlmClient::new(vec![
        "return #{ action: \"score\", value: \"high\" };",
        "return #{ action: \"Score\", value: 9 };",
    ]));
    let context = Context::new("")
        .with_exit(Exit::new("score").with_schema(json!({"type": "integer"})));
    let result = runner(&llm).run(context).await;

    assert!(result.is_success());
    assert!(matches!(
        result.iterations()[0].error,
        Some(IterationError::Exit { ref action, .. }) if action == "score"
    ));
    assert_eq!(result.exit(), Some("score"));
    assert_eq!(result.return_value(), Some(&json!(9)));
}

/// Integration test: object writes land on the host instance
#[tokio::test]
async fn test_object_mutations_are_reconciled() {
    let user = ObjectInstance::builder("user")
        .property(ObjectProperty::new("age", json!(30)).with_schema(json!({"type": "integer"})))
        .property(ObjectProperty::readonly("id", json!("u-1")))
        .build()
        .unwrap();
    let llm = Arc::new(MockLlmClient::new(vec![
        "user.id = \"u-2\";",
        "user.age = 31;\nlisten();",
    ]));
    let result = runner(&llm).run(Context::new("").with_object(user)).await;

    assert!(result.is_success());
    assert!(matches!(
        result.iterations()[0].error,
        Some(IterationError::Assignment { .. })
    ));
    let user = result.context.object("user").unwrap();
    assert_eq!(user.get("age"), Some(&json!(31)));
    assert_eq!(user.get("id"), Some(&json!("u-1")));
    assert_eq!(result.iterations()[1].mutations.len(), 1);
}

/// Integration test: both backends produce the same run
#[tokio::test]
async fn test_backends_agree() {
    let script = "let items = [1, 2, 3];\nlet sum = 0;\nfor i in items { sum += i; }\nreturn #{ action: \"respond\", value: sum };";
    let mut variables = Vec::new();
    for backend in [VmBackend::Inline, VmBackend::Isolated] {
        let llm = Arc::new(MockLlmClient::new(vec![script]));
        let config = ExecutionConfig {
            backend,
            ..ExecutionConfig::default()
        };
        let result = ExecutionLoop::with_config(llm, config).run(Context::new("")).await;
        assert!(result.is_success(), "{}: {:?}", backend, result.error);
        assert_eq!(result.return_value(), Some(&json!(6)));
        variables.push(result.context.variables.clone());
    }
    assert_eq!(variables[0], variables[1]);
}

/// Integration test: every tool call leaves exactly one trace
#[tokio::test]
async fn test_tool_call_traces() {
    let lookup = ToolImplementation::from_sync_fn("lookup", |input| Ok(json!({"id": input})));
    let broken = ToolImplementation::from_sync_fn("broken", |_| Err(ToolError::failed("offline")));
    let llm = Arc::new(MockLlmClient::new(vec![
        "let a = lookup(1);\nlet b = lookup(2);\nlet c = broken();",
        "listen();",
    ]));
    let result = runner(&llm)
        .run(Context::new("").with_tools([lookup, broken]))
        .await;

    let first = &result.iterations()[0];
    assert_eq!(first.status, IterationStatus::Error);
    let calls: Vec<_> = first
        .traces
        .iter()
        .filter_map(|t| match t {
            codeloop::domain::Trace::ToolCall(call) => Some(call),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].success && calls[1].success);
    assert!(!calls[2].success);
    assert_eq!(calls[2].error.as_deref(), Some("offline"));
}

/// Integration test: injected variables are sealed records
#[tokio::test]
async fn test_injected_records_are_sealed() {
    let llm = Arc::new(MockLlmClient::new(vec![
        "profile.nickname = \"ace\";",
        "profile.name = \"Grace\";\nreturn #{ action: \"respond\", value: profile.name };",
    ]));
    let context = Context::new("").with_variable("profile", json!({"name": "Ada"}));
    let result = runner(&llm).run(context).await;

    assert!(result.is_success());
    assert_eq!(result.iterations()[0].status, IterationStatus::Error);
    assert_eq!(result.return_value(), Some(&json!("Grace")));
}
