//! ID generation utilities for codeloop
//!
//! Provides functions for generating identifiers for contexts, iterations,
//! tool calls and snapshots.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn random_suffix() -> String {
    let random: u16 = rand::rng().random();
    format!("{:04x}", random)
}

/// Generate a context ID
///
/// Format: `ctx-{timestamp_ms}-{random_hex}`
/// Example: `ctx-1738300800123-a1b2`
pub fn generate_context_id() -> String {
    format!("ctx-{}-{}", now_ms(), random_suffix())
}

/// Generate an iteration ID from its context and 1-based position
///
/// Format: `{context_id}_{n}`
pub fn generate_iteration_id(context_id: &str, n: usize) -> String {
    format!("{}_{}", context_id, n)
}

/// Generate a tool call ID
///
/// Format: `tcall-{timestamp_ms}-{random_hex}`
pub fn generate_tool_call_id() -> String {
    format!("tcall-{}-{}", now_ms(), random_suffix())
}

/// Generate a snapshot ID
///
/// Format: `snap-{timestamp_ms}-{random_hex}`
pub fn generate_snapshot_id() -> String {
    format!("snap-{}-{}", now_ms(), random_suffix())
}
