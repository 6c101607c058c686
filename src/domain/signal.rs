//! Signal taxonomy for sandboxed scripts
//!
//! Signals are how a script asks the engine to pause, hand off, or think
//! again. They travel through the sandbox as thrown values but are never
//! errors: the VM driver reports them as a suspended, successful outcome.
//! Every variant serializes with a `type` discriminant so a signal captured
//! in a snapshot deserializes back into the same variant.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Code ran but reached no final action
    Think,
    /// Wait for new external input
    Listen,
    /// Run another unit of work with an input
    Execute,
    /// Hand control to another flow
    Transition,
    /// Pause the whole context until a host-side result is available
    Interrupt,
    /// Links a resumed run to the interrupt it resumes
    SnapshotCorrelation,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Think => "think",
            SignalKind::Listen => "listen",
            SignalKind::Execute => "execute",
            SignalKind::Transition => "transition",
            SignalKind::Interrupt => "interrupt",
            SignalKind::SnapshotCorrelation => "snapshot_correlation",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cooperative suspension or control-transfer request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Think(ThinkSignal),
    Listen(ListenSignal),
    Execute(ExecuteSignal),
    Transition(TransitionSignal),
    Interrupt(InterruptSignal),
    SnapshotCorrelation(CorrelationSignal),
}

impl Signal {
    /// Create a think signal with a reason
    pub fn think(reason: impl Into<String>) -> Self {
        Signal::Think(ThinkSignal {
            reason: reason.into(),
            context: None,
        })
    }

    /// Create a listen signal
    pub fn listen() -> Self {
        Signal::Listen(ListenSignal { reason: None })
    }

    /// Create an execute signal
    pub fn execute(target: impl Into<String>, input: Value) -> Self {
        Signal::Execute(ExecuteSignal {
            target: target.into(),
            input,
        })
    }

    /// Create a transition signal
    pub fn transition(target: impl Into<String>) -> Self {
        Signal::Transition(TransitionSignal {
            target: target.into(),
            reason: None,
        })
    }

    /// Create an interrupt signal
    pub fn interrupt(reason: impl Into<String>) -> Self {
        Signal::Interrupt(InterruptSignal::new(reason))
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Think(_) => SignalKind::Think,
            Signal::Listen(_) => SignalKind::Listen,
            Signal::Execute(_) => SignalKind::Execute,
            Signal::Transition(_) => SignalKind::Transition,
            Signal::Interrupt(_) => SignalKind::Interrupt,
            Signal::SnapshotCorrelation(_) => SignalKind::SnapshotCorrelation,
        }
    }

    /// True for signals that suspend the entire context
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Signal::Interrupt(_))
    }

    /// True for signals that end an iteration successfully without suspending
    pub fn is_handoff(&self) -> bool {
        matches!(
            self,
            Signal::Listen(_) | Signal::Execute(_) | Signal::Transition(_)
        )
    }

    /// Human-readable reason for logs and corrective messages
    pub fn reason(&self) -> String {
        match self {
            Signal::Think(s) => s.reason.clone(),
            Signal::Listen(s) => s
                .reason
                .clone()
                .unwrap_or_else(|| "Waiting for input".to_string()),
            Signal::Execute(s) => format!("Execute {}", s.target),
            Signal::Transition(s) => s
                .reason
                .clone()
                .unwrap_or_else(|| format!("Transition to {}", s.target)),
            Signal::Interrupt(s) => s.reason.clone(),
            Signal::SnapshotCorrelation(s) => format!("Resumed from snapshot {}", s.snapshot_id),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} signal: {}", self.kind(), self.reason())
    }
}

/// Request to run another model turn with extra context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkSignal {
    pub reason: String,
    /// Values the script wants carried into the next iteration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl ThinkSignal {
    /// Number of entries carried in an object-shaped context
    pub fn context_len(&self) -> usize {
        match &self.context {
            Some(Value::Object(map)) => map.len(),
            Some(Value::Null) | None => 0,
            Some(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteSignal {
    pub target: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSignal {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Request to pause the whole context
///
/// The tool bridge fills `tool_call`; the VM driver fills `variables`,
/// `line` and `stack` at the point of suspension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptSignal {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallInfo>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl InterruptSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            tool_call: None,
            variables: BTreeMap::new(),
            line: None,
            stack: None,
        }
    }
}

/// Metadata about the tool invocation that raised an interrupt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<ToolCallAssignment>,
}

/// Where the result of a tracked call site is assigned in the script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallAssignment {
    /// Variable receiving the call's result
    pub variable: String,
    /// Function name as written at the call site
    pub callee: String,
    /// 1-based line in the original script
    pub line: u32,
}

/// Carried on resume, links the new run to the call it was waiting on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSignal {
    pub snapshot_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallInfo>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_kind_matches_variant() {
        assert_eq!(Signal::think("why").kind(), SignalKind::Think);
        assert_eq!(Signal::listen().kind(), SignalKind::Listen);
        assert_eq!(Signal::transition("billing").kind(), SignalKind::Transition);
        assert_eq!(Signal::execute("job", json!({})).kind(), SignalKind::Execute);
        assert_eq!(Signal::interrupt("wait").kind(), SignalKind::Interrupt);
    }

    #[test]
    fn test_signal_serializes_type_tag() {
        let json = serde_json::to_value(Signal::transition("billing")).unwrap();
        assert_eq!(json["type"], "transition");
        assert_eq!(json["target"], "billing");
    }

    #[test]
    fn test_interrupt_roundtrip_keeps_variant_and_metadata() {
        let mut signal = InterruptSignal::new("awaiting payment");
        signal.tool_call = Some(ToolCallInfo {
            id: "tcall-1-abcd".to_string(),
            name: "getPayment".to_string(),
            object: None,
            input_schema: Some(json!({"type": "object"})),
            output_schema: None,
            input: json!({"id": 7}),
            assignment: Some(ToolCallAssignment {
                variable: "payment".to_string(),
                callee: "getPayment".to_string(),
                line: 2,
            }),
        });
        signal.variables.insert("before".to_string(), json!(1));

        let text = serde_json::to_string(&Signal::Interrupt(signal.clone())).unwrap();
        let restored: Signal = serde_json::from_str(&text).unwrap();
        assert_eq!(restored, Signal::Interrupt(signal));
        assert!(restored.is_interrupt());
    }

    #[test]
    fn test_handoff_classification() {
        assert!(Signal::listen().is_handoff());
        assert!(Signal::transition("x").is_handoff());
        assert!(!Signal::think("x").is_handoff());
        assert!(!Signal::interrupt("x").is_handoff());
    }

    #[test]
    fn test_think_context_len() {
        let mut think = ThinkSignal {
            reason: "r".to_string(),
            context: None,
        };
        assert_eq!(think.context_len(), 0);
        think.context = Some(json!({"a": 1, "b": 2}));
        assert_eq!(think.context_len(), 2);
        think.context = Some(json!("notes"));
        assert_eq!(think.context_len(), 1);
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(
            Signal::interrupt("awaiting payment").to_string(),
            "interrupt signal: awaiting payment"
        );
    }
}
