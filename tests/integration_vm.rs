//! Script VM integration tests
//!
//! Runs compiled scripts on both backends through the public driver API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use codeloop::compiler::{Compiler, ScriptCompiler};
use codeloop::domain::{Signal, Trace, TraceSink, trace_types};
use codeloop::objects::{ObjectInstance, ObjectProperty};
use codeloop::tools::ToolImplementation;
use codeloop::vm::{VmBackend, VmDriver, VmError, VmLimits, VmOutcome, VmRequest, driver_for};
use serde_json::{Value, json};

fn drivers() -> Vec<Arc<dyn VmDriver>> {
    vec![driver_for(VmBackend::Inline), driver_for(VmBackend::Isolated)]
}

fn request(code: &str) -> VmRequest {
    VmRequest::new(ScriptCompiler::new().compile(code).unwrap())
}

/// Integration test: identical scripts give identical results on both backends
#[tokio::test]
async fn test_determinism_across_backends() {
    let code = "let words = [\"a\", \"bb\", \"ccc\"];\nlet lengths = [];\nfor w in words {\n    lengths.push(w.len());\n}\nlet summary = #{ count: lengths.len(), first: words[0] };\nsummary.count";
    let mut outcomes = Vec::new();
    for driver in drivers() {
        let result = driver.execute(request(code)).await;
        assert_eq!(result.outcome, VmOutcome::Completed { value: json!(3) });
        outcomes.push(result.variables);
    }
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0]["lengths"], json!([1, 2, 3]));
    assert_eq!(outcomes[0]["summary"], json!({"count": 3, "first": "a"}));
}

/// Integration test: injected records reject new keys on both backends
#[tokio::test]
async fn test_sealed_record_rejects_new_keys() {
    let variables = BTreeMap::from([("order".to_string(), json!({"id": 7, "paid": false}))]);
    for driver in drivers() {
        let ok = driver
            .execute(
                request("order.paid = true;\nlet paid = order.paid;")
                    .with_variables(variables.clone()),
            )
            .await;
        assert!(ok.is_completed(), "{:?}", ok.outcome);
        assert_eq!(ok.variables["paid"], json!(true));
        assert_eq!(ok.variables["order"], json!({"id": 7, "paid": true}));

        let err = driver
            .execute(request("order.note = \"rush\";").with_variables(variables.clone()))
            .await;
        assert!(
            matches!(err.error(), Some(VmError::Assignment { .. })),
            "{:?}",
            err.outcome
        );
    }
}

/// Integration test: property writes are validated and only real changes are traced
#[tokio::test]
async fn test_property_tracking() {
    let account = ObjectInstance::builder("account")
        .property(
            ObjectProperty::new("balance", json!(100))
                .with_schema(json!({"type": "integer", "minimum": 0})),
        )
        .property(ObjectProperty::readonly("owner", json!("ada")))
        .build()
        .unwrap();

    for driver in drivers() {
        let traces = TraceSink::new();
        let result = driver
            .execute(
                request("account.balance = 100;\naccount.balance = 80;\naccount.balance = 80;")
                    .with_objects(vec![account.clone()])
                    .with_traces(traces.clone()),
            )
            .await;
        assert!(result.is_completed(), "{:?}", result.outcome);
        assert_eq!(traces.count(trace_types::PROPERTY), 1);
        assert_eq!(result.mutations.len(), 1);
        assert_eq!(result.mutations[0].before, json!(100));
        assert_eq!(result.mutations[0].after, json!(80));

        for code in ["account.balance = -5;", "account.owner = \"eve\";"] {
            let result = driver
                .execute(request(code).with_objects(vec![account.clone()]))
                .await;
            assert!(
                matches!(result.error(), Some(VmError::Assignment { .. })),
                "{}: {:?}",
                code,
                result.outcome
            );
            assert!(result.mutations.is_empty());
        }
    }
}

/// Integration test: one tool_call trace per call with the right success flag
#[tokio::test]
async fn test_one_trace_per_tool_call() {
    let echo = ToolImplementation::from_sync_fn("echo", Ok);
    for driver in drivers() {
        let traces = TraceSink::new();
        let result = driver
            .execute(
                request("let a = echo(1);\nlet b = echo(\"two\");\nlet c = [echo(3), echo(4)];")
                    .with_tools(vec![echo.clone()])
                    .with_traces(traces.clone()),
            )
            .await;
        assert!(result.is_completed());
        let calls: Vec<_> = traces
            .snapshot()
            .into_iter()
            .filter_map(|t| match t {
                Trace::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|c| c.success));
        assert_eq!(result.variables["c"], json!([3, 4]));
    }
}

/// Integration test: runaway scripts time out on both backends
#[tokio::test]
async fn test_timeout() {
    let limits = VmLimits {
        timeout: Duration::from_millis(100),
        ..VmLimits::default()
    };
    for driver in drivers() {
        let result = driver
            .execute(request("let i = 0;\nloop {\n    i += 1;\n}").with_limits(limits))
            .await;
        assert_eq!(result.error(), Some(&VmError::Timeout { timeout_ms: 100 }));
    }
}

/// Integration test: top-level return value becomes the completion value
#[tokio::test]
async fn test_return_value() {
    for driver in drivers() {
        let result = driver
            .execute(request("let x = 4;\nreturn #{ action: \"respond\", value: x };"))
            .await;
        let VmOutcome::Completed { value } = result.outcome else {
            panic!("expected completion");
        };
        assert_eq!(value["action"], Value::from("respond"));
        assert_eq!(value["value"], json!(4));
    }
}

/// Integration test: a signal inside try/catch still ends the run at that call
#[tokio::test]
async fn test_caught_interrupt_stops_later_calls() {
    let charges = Arc::new(AtomicUsize::new(0));
    let approve = ToolImplementation::from_sync_fn("approve", |_| {
        Err(Signal::interrupt("needs approval").into())
    });
    let counter = charges.clone();
    let charge = ToolImplementation::from_sync_fn("charge", move |amount| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(amount)
    });
    let code = "try {\n    approve(1);\n} catch (e) {\n}\ncharge(5);\nlet after = 1;";

    for driver in drivers() {
        let result = driver
            .execute(request(code).with_tools(vec![approve.clone(), charge.clone()]))
            .await;
        assert!(
            matches!(result.signal(), Some(Signal::Interrupt(_))),
            "{:?}",
            result.outcome
        );
        assert!(!result.variables.contains_key("after"));
    }
    assert_eq!(charges.load(Ordering::SeqCst), 0);
}

/// Integration test: many values under the per-container caps still hit the memory limit
#[tokio::test]
async fn test_memory_limit_counts_whole_scope() {
    let limits = VmLimits {
        memory_limit_bytes: 16 * 1024,
        ..VmLimits::default()
    };
    let code = "let chunk = \"x\";\nwhile chunk.len() < 1000 {\n    chunk += \"x\";\n}\nlet items = [];\nfor i in 0..200 {\n    items.push(chunk + i);\n}\nitems.len()";
    for driver in drivers() {
        let result = driver.execute(request(code).with_limits(limits)).await;
        assert!(
            matches!(
                result.error(),
                Some(VmError::MemoryLimit { limit_bytes, .. }) if *limit_bytes == 16 * 1024
            ),
            "{:?}",
            result.outcome
        );
    }

    let result = driver_for(VmBackend::Inline)
        .execute(request("let s = \"ab\";\nloop {\n    s += s;\n}").with_limits(limits))
        .await;
    assert!(matches!(result.error(), Some(VmError::MemoryLimit { .. })));
}

/// Integration test: reading an undeclared object property is a runtime error
#[tokio::test]
async fn test_unknown_property_read_is_execution_error() {
    let account = ObjectInstance::builder("account")
        .property(ObjectProperty::new("balance", json!(100)))
        .build()
        .unwrap();
    for driver in drivers() {
        let result = driver
            .execute(request("let e = account.email;").with_objects(vec![account.clone()]))
            .await;
        assert!(
            matches!(result.error(), Some(VmError::Execution { .. })),
            "{:?}",
            result.outcome
        );
    }
}

/// Integration test: a nested call does not steal the outer call's assignment
#[tokio::test]
async fn test_nested_call_keeps_outer_assignment() {
    let lookup = ToolImplementation::from_sync_fn("lookup", Ok);
    let submit = ToolImplementation::from_sync_fn("submit", |_| {
        Err(Signal::interrupt("review submission").into())
    });
    for driver in drivers() {
        let result = driver
            .execute(
                request("let receipt = submit(lookup(1));")
                    .with_tools(vec![lookup.clone(), submit.clone()]),
            )
            .await;
        let Some(Signal::Interrupt(interrupt)) = result.signal() else {
            panic!("expected interrupt, got {:?}", result.outcome);
        };
        let info = interrupt.tool_call.as_ref().unwrap();
        assert_eq!(info.name, "submit");
        assert_eq!(info.assignment.as_ref().unwrap().variable, "receipt");
    }
}
