//! Tools - host functions callable from scripts, the bridge that invokes
//! them, and the schema validator they share with objects and exits

mod bridge;
mod implementation;
pub mod schema;

pub use bridge::{DEFAULT_SLOW_TOOL_MS, ToolBridge, ToolCallRequest};
pub use implementation::{ToolCallContext, ToolError, ToolHandler, ToolImplementation};
pub use schema::SchemaError;
