//! Snapshots of suspended runs
//!
//! An interrupt produces a [`Snapshot`]: the signal, the variables in scope
//! and the code executed so far. The caller stores it however it likes and
//! later settles it with a value or an error; the execution loop then starts
//! a fresh run from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::{CorrelationSignal, InterruptSignal, Signal, ToolCallInfo};
use crate::error::{CodeloopError, Result};
use crate::id::{generate_snapshot_id, now_ms};

/// Settlement state of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SnapshotStatus {
    Pending,
    Resolved { value: Value },
    Rejected { error: String },
}

/// A suspended run, serializable to JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub reason: String,
    pub signal: InterruptSignal,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Code executed up to the suspension point
    #[serde(default)]
    pub stack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_fingerprint: Option<String>,
    pub status: SnapshotStatus,
    pub created_at: u64,
}

impl Snapshot {
    pub fn from_interrupt(signal: &InterruptSignal, code: Option<&str>) -> Self {
        Self {
            id: generate_snapshot_id(),
            reason: signal.reason.clone(),
            signal: signal.clone(),
            variables: signal.variables.clone(),
            stack: signal.stack.clone().unwrap_or_default(),
            code_fingerprint: code.map(fingerprint),
            status: SnapshotStatus::Pending,
            created_at: now_ms(),
        }
    }

    pub fn tool_call(&self) -> Option<&ToolCallInfo> {
        self.signal.tool_call.as_ref()
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.status, SnapshotStatus::Pending)
    }

    /// Settle with the value the interrupted call should have produced
    pub fn resolve(&mut self, value: Value) -> Result<()> {
        self.ensure_pending()?;
        self.status = SnapshotStatus::Resolved { value };
        Ok(())
    }

    /// Settle with the error the interrupted call should have raised
    pub fn reject(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_pending()?;
        self.status = SnapshotStatus::Rejected { error: error.into() };
        Ok(())
    }

    fn ensure_pending(&self) -> Result<()> {
        if self.is_settled() {
            return Err(CodeloopError::Snapshot(format!(
                "Snapshot {} is already settled",
                self.id
            )));
        }
        Ok(())
    }

    /// Signal linking a resumed run back to this snapshot
    pub fn correlation(&self) -> CorrelationSignal {
        let (resolved, value, error) = match &self.status {
            SnapshotStatus::Resolved { value } => (true, Some(value.clone()), None),
            SnapshotStatus::Rejected { error } => (false, None, Some(error.clone())),
            SnapshotStatus::Pending => (false, None, None),
        };
        CorrelationSignal {
            snapshot_id: self.id.clone(),
            tool_call: self.tool_call().cloned(),
            resolved,
            value,
            error,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// First 8 bytes of the SHA-256 of `code`, hex-encoded
pub fn fingerprint(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// Produces snapshots for interrupt-class signals
pub trait SnapshotCollaborator: Send + Sync {
    fn create(&self, signal: &Signal, code: Option<&str>) -> Result<Snapshot>;
}

/// Builds snapshots straight from the interrupt signal
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSnapshots;

impl SnapshotCollaborator for DefaultSnapshots {
    fn create(&self, signal: &Signal, code: Option<&str>) -> Result<Snapshot> {
        match signal {
            Signal::Interrupt(interrupt) => {
                let snapshot = Snapshot::from_interrupt(interrupt, code);
                log::info!("Created snapshot {}: {}", snapshot.id, snapshot.reason);
                Ok(snapshot)
            }
            other => Err(CodeloopError::Snapshot(format!(
                "Cannot snapshot a {} signal",
                other.kind()
            ))),
        }
    }
}
