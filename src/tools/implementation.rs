//! Host-implemented tools
//!
//! A [`ToolImplementation`] pairs tool metadata (name, aliases, schemas) with
//! an async [`ToolHandler`]. The engine treats handlers as stateless and never
//! inspects them beyond calling them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use thiserror::Error;

use crate::domain::Signal;

/// How a tool call ended when it did not return a value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    /// Deliberate suspension or control transfer, not a failure
    #[error("{0}")]
    Signal(Signal),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        ToolError::Failed(message.into())
    }

    pub fn is_signal(&self) -> bool {
        matches!(self, ToolError::Signal(_))
    }
}

impl From<Signal> for ToolError {
    fn from(signal: Signal) -> Self {
        ToolError::Signal(signal)
    }
}

/// Per-call information handed to a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallContext {
    pub call_id: String,
    pub tool_name: String,
    /// Owning object when the tool is called as a method
    pub object: Option<String>,
}

/// The callable behind a tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: Value, ctx: &ToolCallContext) -> Result<Value, ToolError>;
}

type AsyncToolFn =
    dyn Fn(Value, ToolCallContext) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

struct FnHandler {
    f: Box<AsyncToolFn>,
}

#[async_trait]
impl ToolHandler for FnHandler {
    async fn call(&self, input: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        (self.f)(input, ctx.clone()).await
    }
}

struct SyncFnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> ToolHandler for SyncFnHandler<F>
where
    F: Fn(Value) -> Result<Value, ToolError> + Send + Sync,
{
    async fn call(&self, input: Value, _ctx: &ToolCallContext) -> Result<Value, ToolError> {
        (self.f)(input)
    }
}

/// A host function exposed to sandboxed scripts
#[derive(Clone)]
pub struct ToolImplementation {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    handler: Arc<dyn ToolHandler>,
}

impl ToolImplementation {
    /// Create a tool from a handler
    pub fn new(name: impl Into<String>, handler: impl ToolHandler + 'static) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            description: String::new(),
            input_schema: None,
            output_schema: None,
            handler: Arc::new(handler),
        }
    }

    /// Create a tool from an async closure
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, ToolCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let handler = FnHandler {
            f: Box::new(move |input, ctx| Box::pin(f(input, ctx))),
        };
        Self::new(name, handler)
    }

    /// Create a tool from a synchronous closure
    pub fn from_sync_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self::new(name, SyncFnHandler { f })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Primary name followed by aliases
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    pub fn matches(&self, name: &str) -> bool {
        self.names().any(|n| n == name)
    }

    pub async fn call(&self, input: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        self.handler.call(input, ctx).await
    }

    /// Description of the tool as shown to the model
    pub fn describe(&self) -> Value {
        let mut info = json!({
            "name": self.name,
            "description": self.description,
        });
        if !self.aliases.is_empty() {
            info["aliases"] = json!(self.aliases);
        }
        if let Some(schema) = &self.input_schema {
            info["input"] = schema.clone();
        }
        if let Some(schema) = &self.output_schema {
            info["output"] = schema.clone();
        }
        info
    }
}

impl fmt::Debug for ToolImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolImplementation")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("input_schema", &self.input_schema.is_some())
            .field("output_schema", &self.output_schema.is_some())
            .finish()
    }
}
