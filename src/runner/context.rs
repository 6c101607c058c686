//! Conversation-turn context
//!
//! A [`Context`] holds everything the execution loop needs across
//! iterations: the instructions, the tools, objects and exits exposed to
//! scripts, the carried variables, the pending corrective messages and the
//! iteration history.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::compiler::{is_identifier, is_reserved};
use crate::domain::{Exit, Iteration, Signal};
use crate::error::{CodeloopError, Result};
use crate::id::{generate_context_id, generate_iteration_id};
use crate::llm::Message;
use crate::llm::anthropic::DEFAULT_MODEL;
use crate::objects::{ObjectInstance, ObjectMutation};
use crate::protocol::{FencedProtocol, PromptInputs, ProtocolAdapter};
use crate::snapshot::Snapshot;
use crate::tools::ToolImplementation;

/// Default number of iterations per attempt
pub const DEFAULT_LOOP_LIMIT: u32 = 3;

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Options governing one run
#[derive(Debug, Clone, PartialEq)]
pub struct ContextOptions {
    pub loop_limit: u32,
    pub temperature: f32,
    pub model: String,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            loop_limit: DEFAULT_LOOP_LIMIT,
            temperature: DEFAULT_TEMPERATURE,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl ContextOptions {
    pub fn with_loop_limit(mut self, loop_limit: u32) -> Self {
        self.loop_limit = loop_limit;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// State of one logical conversation turn
pub struct Context {
    pub id: String,
    pub instructions: String,
    pub options: ContextOptions,
    /// Carried between iterations and injected as script globals
    pub variables: BTreeMap<String, Value>,
    objects: Vec<ObjectInstance>,
    tools: Vec<ToolImplementation>,
    exits: Vec<Exit>,
    transcript: Vec<Message>,
    iterations: Vec<Iteration>,
    pending: Vec<Message>,
    attempt: u32,
    protocol: Arc<dyn ProtocolAdapter>,
    resume: Option<Snapshot>,
    correlation: Option<Signal>,
}

impl Context {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            id: generate_context_id(),
            instructions: instructions.into(),
            options: ContextOptions::default(),
            variables: BTreeMap::new(),
            objects: Vec::new(),
            tools: Vec::new(),
            exits: Vec::new(),
            transcript: Vec::new(),
            iterations: Vec::new(),
            pending: Vec::new(),
            attempt: 0,
            protocol: Arc::new(FencedProtocol::new()),
            resume: None,
            correlation: None,
        }
    }

    pub fn with_options(mut self, options: ContextOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_object(mut self, object: ObjectInstance) -> Self {
        self.objects.push(object);
        self
    }

    pub fn with_tool(mut self, tool: ToolImplementation) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = ToolImplementation>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn with_exit(mut self, exit: Exit) -> Self {
        self.exits.push(exit);
        self
    }

    pub fn with_transcript(mut self, transcript: Vec<Message>) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn ProtocolAdapter>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Continue from a settled snapshot on the next run
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.resume = Some(snapshot);
        self
    }

    pub fn objects(&self) -> &[ObjectInstance] {
        &self.objects
    }

    pub fn object(&self, name: &str) -> Option<&ObjectInstance> {
        self.objects.iter().find(|o| o.name() == name)
    }

    pub fn tools(&self) -> &[ToolImplementation] {
        &self.tools
    }

    pub fn exits(&self) -> &[Exit] {
        &self.exits
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn iterations(&self) -> &[Iteration] {
        &self.iterations
    }

    pub fn last_iteration(&self) -> Option<&Iteration> {
        self.iterations.last()
    }

    pub fn pending_messages(&self) -> &[Message] {
        &self.pending
    }

    pub fn protocol(&self) -> &dyn ProtocolAdapter {
        self.protocol.as_ref()
    }

    /// Iterations started in the current attempt
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn prompt_inputs(&self) -> PromptInputs<'_> {
        PromptInputs {
            instructions: &self.instructions,
            objects: &self.objects,
            tools: &self.tools,
            exits: &self.exits,
            transcript: &self.transcript,
        }
    }

    /// Reject names that would shadow each other or the built-ins
    pub fn validate(&self) -> Result<()> {
        if self.options.loop_limit == 0 {
            return Err(CodeloopError::InvalidContext(
                "loop limit must be at least 1".to_string(),
            ));
        }

        let mut globals = HashSet::new();
        let tool_names = self.tools.iter().flat_map(|t| t.names());
        let object_names = self.objects.iter().map(|o| o.name());
        for name in tool_names.chain(object_names) {
            if !is_identifier(name) {
                return Err(CodeloopError::InvalidContext(format!(
                    "\"{}\" is not a valid identifier",
                    name
                )));
            }
            if is_reserved(name) {
                return Err(CodeloopError::InvalidContext(format!(
                    "\"{}\" is a reserved name",
                    name
                )));
            }
            if !globals.insert(name) {
                return Err(CodeloopError::InvalidContext(format!(
                    "\"{}\" is defined more than once",
                    name
                )));
            }
        }

        let mut exits = HashSet::new();
        for name in self.exits.iter().flat_map(|e| e.names()) {
            if is_reserved(name) {
                return Err(CodeloopError::InvalidContext(format!(
                    "Exit \"{}\" is a reserved name",
                    name
                )));
            }
            if !exits.insert(name.to_lowercase()) {
                return Err(CodeloopError::InvalidContext(format!(
                    "Exit \"{}\" is defined more than once",
                    name
                )));
            }
        }

        for name in self.variables.keys() {
            if !is_identifier(name) || is_reserved(name) || globals.contains(name.as_str()) {
                return Err(CodeloopError::InvalidContext(format!(
                    "Variable \"{}\" cannot be injected",
                    name
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn begin_iteration(&mut self) -> String {
        self.attempt += 1;
        generate_iteration_id(&self.id, self.iterations.len() + 1)
    }

    pub(crate) fn push_iteration(&mut self, iteration: Iteration) {
        self.iterations.push(iteration);
    }

    pub(crate) fn push_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.pending.extend(messages);
    }

    /// Called once an attempt succeeds outright
    pub(crate) fn finish_attempt(&mut self) {
        self.pending.clear();
        self.attempt = 0;
    }

    pub(crate) fn reconcile(&mut self, mutations: &[ObjectMutation]) {
        for object in &mut self.objects {
            object.reconcile(mutations);
        }
    }

    pub(crate) fn take_snapshot(&mut self) -> Option<Snapshot> {
        self.resume.take()
    }

    pub(crate) fn set_correlation(&mut self, signal: Signal) {
        self.correlation = Some(signal);
    }

    pub(crate) fn take_correlation(&mut self) -> Option<Signal> {
        self.correlation.take()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("objects", &self.objects.len())
            .field("tools", &self.tools.len())
            .field("exits", &self.exits)
            .field("variables", &self.variables)
            .field("iterations", &self.iterations.len())
            .field("pending", &self.pending.len())
            .field("attempt", &self.attempt)
            .field("protocol", &self.protocol.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectProperty;
    use serde_json::json;

    fn tool(name: &str) -> ToolImplementation {
        ToolImplementation::from_sync_fn(name, |_| Ok(Value::Null))
    }

    #[test]
    fn test_context_defaults() {
        let context = Context::new("Help the user");
        assert!(context.id.starts_with("ctx-"));
        assert_eq!(context.options.loop_limit, 3);
        assert_eq!(context.options.temperature, 0.7);
        assert_eq!(context.attempt(), 0);
        assert!(context.iterations().is_empty());
        assert!(context.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_reserved_tool() {
        let context = Context::new("").with_tool(tool("think"));
        let err = context.validate().unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_validate_rejects_duplicate_globals() {
        let user = ObjectInstance::builder("user")
            .property(ObjectProperty::new("name", json!("Ada")))
            .build()
            .unwrap();
        let context = Context::new("").with_object(user).with_tool(tool("user"));
        assert!(context.validate().unwrap_err().to_string().contains("more than once"));

        let context = Context::new("")
            .with_tool(tool("lookup"))
            .with_tool(tool("find").with_alias("lookup"));
        assert!(context.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_exits_and_variables() {
        let context = Context::new("")
            .with_exit(Exit::new("respond"))
            .with_exit(Exit::new("reply").with_alias("RESPOND"));
        assert!(context.validate().is_err());

        let context = Context::new("").with_exit(Exit::new("listen"));
        assert!(context.validate().is_err());

        let context = Context::new("")
            .with_tool(tool("lookup"))
            .with_variable("lookup", json!(1));
        assert!(context.validate().is_err());

        let context = Context::new("").with_variable("first-name", json!("Ada"));
        assert!(context.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_loop_limit() {
        let context =
            Context::new("").with_options(ContextOptions::default().with_loop_limit(0));
        assert!(matches!(
            context.validate().unwrap_err(),
            CodeloopError::InvalidContext(_)
        ));
    }

    #[test]
    fn test_attempt_bookkeeping() {
        let mut context = Context::new("");
        let first = context.begin_iteration();
        assert!(first.ends_with("_1"));
        assert_eq!(context.attempt(), 1);
        context.push_messages([Message::user("fix it")]);
        assert_eq!(context.pending_messages().len(), 1);
        context.finish_attempt();
        assert_eq!(context.attempt(), 0);
        assert!(context.pending_messages().is_empty());
    }

    #[test]
    fn test_reconcile_updates_objects() {
        let user = ObjectInstance::builder("user")
            .property(ObjectProperty::new("name", json!("Ada")))
            .build()
            .unwrap();
        let mut context = Context::new("").with_object(user);
        context.reconcile(&[ObjectMutation {
            object: "user".to_string(),
            property: "name".to_string(),
            before: json!("Ada"),
            after: json!("Grace"),
        }]);
        assert_eq!(context.object("user").unwrap().get("name"), Some(&json!("Grace")));
    }
}
