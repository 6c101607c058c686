//! Fenced code protocol
//!
//! The model writes one script between `■fn_start` and `■fn_end`. The end
//! marker doubles as the stop sequence, so responses usually arrive without
//! it.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::render::PromptRenderer;
use super::{
    ParsedResponse, PromptInputs, ProtocolAdapter, ResponseKind, VM_MESSAGE_HEADER, VM_SPEAKER,
};
use crate::domain::ThinkSignal;
use crate::error::Result;
use crate::llm::{Message, Preserve, Role, WrapOptions, wrap, wrap_content};
use crate::snapshot::Snapshot;

pub const FN_START: &str = "■fn_start";
pub const FN_END: &str = "■fn_end";

const IM_START: &str = "■im_start";
const IM_END: &str = "■im_end";

const VERSION: &str = "fenced-2024-10";
const LEGACY_VERSION: &str = "fenced-legacy";

const SYSTEM_TEMPLATE: &str = r#"
You are an agent that acts by writing short Rhai scripts. Each reply is exactly one script, which the VM runs in a sandbox.

# Identity

{{identity}}

# Writing code

- Wrap the script between {{fn_start}} and {{fn_end}}. Write nothing outside the markers.
- Declare variables with `let`. Variables you assign are carried into the next turn.
- Call tools as plain functions: `let result = lookup(input);`. Calls block until the tool returns.
- Finish by returning an exit: `return #{ action: "<exit>", value: ... };`
- Call `think(reason, #{ key: value })` to inspect values before deciding what to do.
- `listen()` waits for new input. `transition(target)` and `execute(target, input)` hand control elsewhere.
- `console.log(...)` output is recorded for debugging and never shown to the user.
{{#if tools}}

# Tools
{{#each tools}}

## {{name}}
{{#if description}}
{{description}}
{{/if}}
{{#if aliases}}
Aliases: {{aliases}}
{{/if}}
{{#if input}}
Input schema: {{input}}
{{/if}}
{{#if output}}
Output schema: {{output}}
{{/if}}
{{/each}}
{{/if}}
{{#if objects}}

# Objects
{{#each objects}}

## {{name}}
{{#if description}}
{{description}}
{{/if}}
{{#each properties}}
- `{{../name}}.{{name}}` ({{access}}){{#if schema}} schema: {{schema}}{{/if}}{{#if description}} - {{description}}{{/if}}
{{/each}}
{{#each tools}}
- `{{../name}}.{{name}}(input)`{{#if description}} - {{description}}{{/if}}
{{/each}}
{{/each}}

Objects are sealed: adding a property fails.
{{#if writable}}
Writable: {{writable}}
{{/if}}
{{#if readonly}}
Read-only (writing fails): {{readonly}}
{{/if}}
{{/if}}

# Exits

{{#if exits}}
{{#each exits}}
- `{{name}}`{{#if aliases}} (aliases: {{aliases}}){{/if}}{{#if description}} - {{description}}{{/if}}{{#if schema}} value schema: {{schema}}{{/if}}
{{/each}}
{{else}}
Any action name is accepted as an exit.
{{/if}}

# Transcript

{{transcript}}
"#;

/// Fenced-code prompting convention
#[derive(Debug)]
pub struct FencedProtocol {
    legacy: bool,
    renderer: PromptRenderer,
}

impl Default for FencedProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl FencedProtocol {
    pub fn new() -> Self {
        Self {
            legacy: false,
            renderer: PromptRenderer::new(),
        }
    }

    /// Older convention that always counts a think as executed code
    pub fn legacy() -> Self {
        Self {
            legacy: true,
            ..Self::new()
        }
    }

    fn vm_message(body: String) -> Message {
        Message::user(format!("{}\n\n{}", VM_MESSAGE_HEADER, body.trim())).with_name(VM_SPEAKER)
    }

    fn expected_output() -> String {
        format!("Expected output:\n\n```rhai\n{}\n// code here\n{}\n```", FN_START, FN_END)
    }

    /// Stack excerpt without its final (suspended) line
    fn executed_lines(snapshot: &Snapshot) -> String {
        let lines: Vec<&str> = snapshot.stack.lines().collect();
        lines[..lines.len().saturating_sub(1)].join("\n")
    }

    fn call_description(snapshot: &Snapshot) -> String {
        match snapshot.tool_call() {
            Some(call) => match &call.object {
                Some(object) => format!("{}.{}({})", object, call.name, call.input),
                None => format!("{}({})", call.name, call.input),
            },
            None => snapshot.reason.clone(),
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn schema_text(schema: Option<&Value>) -> String {
    schema.map(Value::to_string).unwrap_or_default()
}

fn render_transcript(transcript: &[Message]) -> String {
    if transcript.is_empty() {
        return "No messages yet.".to_string();
    }
    let lines: Vec<String> = transcript
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            format!("{}: {}", role, m.content.trim())
        })
        .collect();
    wrap_content(&lines.join("\n"), WrapOptions::default().preserve(Preserve::Bottom))
}

fn render_context(context: Option<&Value>) -> String {
    match context {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| format!("Value of {} is {}", key, pretty(value)))
            .collect::<Vec<_>>()
            .join("\n\n"),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, value)| format!("Value at index {} is {}", i, pretty(value)))
            .collect::<Vec<_>>()
            .join("\n\n"),
        Some(other) => pretty(other),
    }
}

impl ProtocolAdapter for FencedProtocol {
    fn version(&self) -> &str {
        if self.legacy { LEGACY_VERSION } else { VERSION }
    }

    fn parse_response(&self, raw: &str) -> ParsedResponse {
        let mut text = raw.to_string();
        if !text.contains(FN_START) {
            text = format!("{}\n{}", FN_START, text.trim());
        }
        if !text.contains(FN_END) {
            text = format!("{}\n{}", text.trim(), FN_END);
        }

        let start = text.find(FN_START).map(|i| i + FN_START.len()).unwrap_or(0);
        let end = text[start..].find(FN_END).map(|i| start + i).unwrap_or(text.len());
        let body = text[start..end].trim();

        let lines: Vec<&str> = body.lines().collect();
        let last = lines.len().saturating_sub(1);
        let code = lines
            .iter()
            .enumerate()
            .filter(|(i, line)| !((*i == 0 || *i == last) && line.trim().starts_with("```")))
            .map(|(_, line)| *line)
            .collect::<Vec<_>>()
            .join("\n");

        let kind = if code.trim().is_empty() {
            ResponseKind::Empty
        } else {
            ResponseKind::Code
        };

        ParsedResponse {
            kind,
            code,
            raw: raw.to_string(),
        }
    }

    fn stop_sequences(&self) -> Vec<String> {
        vec![FN_END.to_string()]
    }

    fn system_message(&self, inputs: &PromptInputs<'_>) -> Result<Message> {
        let tools: Vec<Value> = inputs
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "aliases": t.aliases.join(", "),
                    "input": schema_text(t.input_schema.as_ref()),
                    "output": schema_text(t.output_schema.as_ref()),
                })
            })
            .collect();

        let mut writable = Vec::new();
        let mut readonly = Vec::new();
        let objects: Vec<Value> = inputs
            .objects
            .iter()
            .map(|o| {
                let properties: Vec<Value> = o
                    .properties()
                    .iter()
                    .map(|p| {
                        let path = format!("{}.{}", o.name(), p.name);
                        if p.writable {
                            writable.push(path);
                        } else {
                            readonly.push(path);
                        }
                        json!({
                            "name": p.name,
                            "access": if p.writable { "writable" } else { "read-only" },
                            "schema": schema_text(p.schema.as_ref()),
                            "description": p.description,
                        })
                    })
                    .collect();
                let tools: Vec<Value> = o
                    .tools()
                    .iter()
                    .map(|t| json!({"name": t.name, "description": t.description}))
                    .collect();
                json!({
                    "name": o.name(),
                    "description": o.description(),
                    "properties": properties,
                    "tools": tools,
                })
            })
            .collect();

        let exits: Vec<Value> = inputs
            .exits
            .iter()
            .map(|e| {
                json!({
                    "name": e.name,
                    "aliases": e.aliases.join(", "),
                    "description": e.description,
                    "schema": schema_text(e.schema.as_ref()),
                })
            })
            .collect();

        let identity = if inputs.instructions.trim().is_empty() {
            "No specific instructions provided".to_string()
        } else {
            wrap(inputs.instructions.trim())
        };

        let context = json!({
            "identity": identity,
            "fn_start": FN_START,
            "fn_end": FN_END,
            "tools": tools,
            "objects": objects,
            "writable": writable.join(", "),
            "readonly": readonly.join(", "),
            "exits": exits,
            "transcript": render_transcript(inputs.transcript),
        });

        Ok(Message::system(self.renderer.render(SYSTEM_TEMPLATE, &context)?))
    }

    fn initial_user_message(&self, inputs: &PromptInputs<'_>) -> Result<Message> {
        let recap = match inputs.transcript.last() {
            Some(last) if last.role == Role::User => format!(
                "The user spoke last. Here's what they said:\n{}\n{}\n{}",
                IM_START,
                last.content.trim(),
                IM_END
            ),
            Some(last) if last.role == Role::Assistant => format!(
                "You are the one who spoke last. Here's what you said last:\n{}\n{}\n{}",
                IM_START,
                last.content.trim(),
                IM_END
            ),
            _ => "Nobody has spoken yet in this conversation. You can start by saying something.".to_string(),
        };

        Ok(Message::user(format!(
            "{}\n\nWrite the script for your next action.\n\n{}",
            recap,
            Self::expected_output()
        )))
    }

    fn assistant_message(&self, code: &str) -> Message {
        Message::assistant(format!("{}\n{}\n{}", FN_START, code.trim(), FN_END))
    }

    fn invalid_code_message(&self, code: &str, error: &str) -> Message {
        Self::vm_message(format!(
            "The code you provided is invalid. Here's the error:\n\nCode:\n\n```rhai\n{}\n{}\n{}\n```\n\nError:\n```\n{}\n```\n\nPlease fix the error and try again.\n\n{}",
            FN_START,
            wrap(code),
            FN_END,
            wrap_content(error, WrapOptions::default().flex(4)),
            Self::expected_output()
        ))
    }

    fn execution_error_message(&self, message: &str, stack: &str) -> Message {
        let top = WrapOptions::default().preserve(Preserve::Top);
        Self::vm_message(format!(
            "An error occurred while executing the code.\n\n{}\n\nStack Trace:\n```\n{}\n```\n\nLet the user know that an error occurred, and if possible, try something else. Do not repeat yourself in the message.\n\n{}",
            wrap_content(message, top.flex(4)),
            wrap_content(stack, top.flex(6)),
            Self::expected_output()
        ))
    }

    fn thinking_message(&self, signal: &ThinkSignal) -> Message {
        Self::vm_message(format!(
            "The assistant requested to think. Here's the context:\n-------------------\nReason: {}\nContext:\n{}\n-------------------\n\nPlease continue with the conversation ({}).",
            signal.reason,
            wrap_content(
                &render_context(signal.context.as_ref()),
                WrapOptions::default().preserve(Preserve::Top)
            ),
            FN_START
        ))
    }

    fn snapshot_resolved_message(
        &self,
        snapshot: &Snapshot,
        value: &Value,
        variables: &BTreeMap<String, Value>,
    ) -> Message {
        let restored: Vec<String> = variables
            .iter()
            .map(|(name, value)| {
                format!(
                    "// Variable \"{}\" restored with its full value:\n// {}",
                    name,
                    pretty(value).replace('\n', "\n// ")
                )
            })
            .collect();
        let names: Vec<&str> = variables.keys().map(String::as_str).collect();
        let output = pretty(value).replace('\n', "\n * ");

        Self::vm_message(format!(
            "The execution of an asynchronous code block has been completed. Here's the code that was executed:\n{}\n// {}\n```rhai\n/**\n * Here's the output:\n * {}\n * */\n```\n\nContinue the conversation from here, without repeating the above code, as it has already been executed. Here's the variables you can rely on:\n\n```rhai\n{}\n```\n\nYou can now assume that the code you are about to generate can rely on the variables \"{}\" being available.\nThere are NO OTHER VARIABLES than the ones listed above.\n\nIMPORTANT: Do NOT re-run the code that was already executed. This would be a critical error. Instead, continue the conversation from here.\n\n{}",
            Self::executed_lines(snapshot),
            Self::call_description(snapshot),
            wrap_content(&output, WrapOptions::default().preserve(Preserve::Top).flex(4)),
            wrap(&restored.join("\n")),
            names.join("\", \""),
            Self::expected_output()
        ))
    }

    fn snapshot_rejected_message(&self, snapshot: &Snapshot, error: &str) -> Message {
        let output = error.replace('\n', "\n * ");
        Self::vm_message(format!(
            "An error occurred while executing the code. Here is the code that was executed so far:\n\n{}\n\n// {}\nHere's the error:\n{}\n\nContinue the conversation from here, without repeating the above code, as it has already been executed.\nIMPORTANT: Do NOT re-run the code that was already executed. This would be a critical error. Instead, continue the conversation from here.\n\n{}",
            Self::executed_lines(snapshot),
            Self::call_description(snapshot),
            wrap_content(
                &output,
                WrapOptions::default().preserve(Preserve::Both).min_tokens(100)
            ),
            Self::expected_output()
        ))
    }

    fn reports_code_executed(&self) -> bool {
        self.legacy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Exit, InterruptSignal};
    use crate::llm::strip_markers;
    use crate::objects::{ObjectInstance, ObjectProperty};
    use crate::tools::ToolImplementation;

    fn inputs<'a>(
        objects: &'a [ObjectInstance],
        tools: &'a [ToolImplementation],
        exits: &'a [Exit],
        transcript: &'a [Message],
    ) -> PromptInputs<'a> {
        PromptInputs {
            instructions: "You help with orders.",
            objects,
            tools,
            exits,
            transcript,
        }
    }

    #[test]
    fn test_parse_adds_missing_markers() {
        let protocol = FencedProtocol::new();
        let parsed = protocol.parse_response("let a = 1;\nlet b = 2;");
        assert_eq!(parsed.kind, ResponseKind::Code);
        assert_eq!(parsed.code, "let a = 1;\nlet b = 2;");
        assert_eq!(parsed.raw, "let a = 1;\nlet b = 2;");
    }

    #[test]
    fn test_parse_strips_markers_and_fences() {
        let protocol = FencedProtocol::new();
        let raw = "Sure!\n■fn_start\n```rhai\nlet a = 1;\n```\n■fn_end trailing";
        let parsed = protocol.parse_response(raw);
        assert_eq!(parsed.code, "let a = 1;");
    }

    #[test]
    fn test_parse_without_end_marker() {
        let parsed = FencedProtocol::new().parse_response("■fn_start\nlet x = 3;\n");
        assert_eq!(parsed.code, "let x = 3;");
    }

    #[test]
    fn test_parse_empty_response() {
        let parsed = FencedProtocol::new().parse_response("  \n ");
        assert_eq!(parsed.kind, ResponseKind::Empty);
    }

    #[test]
    fn test_stop_sequences_and_versions() {
        assert_eq!(FencedProtocol::new().stop_sequences(), vec!["■fn_end"]);
        assert!(!FencedProtocol::new().reports_code_executed());
        assert!(FencedProtocol::legacy().reports_code_executed());
        assert_ne!(FencedProtocol::new().version(), FencedProtocol::legacy().version());
    }

    #[test]
    fn test_system_message_lists_tools_objects_exits() {
        let user = ObjectInstance::builder("user")
            .description("The current user")
            .property(ObjectProperty::new("email", json!("a@b.c")))
            .property(ObjectProperty::readonly("id", json!(7)))
            .tool(ToolImplementation::from_sync_fn("save", |_| Ok(Value::Null)).with_description("Persist"))
            .build()
            .unwrap();
        let tools = vec![
            ToolImplementation::from_sync_fn("lookup", |_| Ok(Value::Null))
                .with_description("Find an order")
                .with_input_schema(json!({"type": "integer"})),
        ];
        let exits = vec![Exit::new("respond").with_alias("reply")];
        let objects = vec![user];
        let transcript = vec![Message::user("Where is my order?")];

        let message = FencedProtocol::new()
            .system_message(&inputs(&objects, &tools, &exits, &transcript))
            .unwrap();
        assert_eq!(message.role, Role::System);
        let content = strip_markers(&message.content);
        assert!(content.contains("You help with orders."));
        assert!(content.contains("## lookup"));
        assert!(content.contains("Input schema: {\"type\":\"integer\"}"));
        assert!(content.contains("`user.email` (writable)"));
        assert!(content.contains("`user.id` (read-only)"));
        assert!(content.contains("`user.save(input)` - Persist"));
        assert!(content.contains("Read-only (writing fails): user.id"));
        assert!(content.contains("`respond` (aliases: reply)"));
        assert!(content.contains("user: Where is my order?"));
        assert!(!content.contains("\n\n\n"));
    }

    #[test]
    fn test_system_message_without_exits() {
        let message = FencedProtocol::new()
            .system_message(&inputs(&[], &[], &[], &[]))
            .unwrap();
        assert!(message.content.contains("Any action name is accepted as an exit."));
        assert!(!message.content.contains("# Tools"));
        assert!(message.content.contains("No messages yet."));
    }

    #[test]
    fn test_initial_user_message_recaps_last_speaker() {
        let protocol = FencedProtocol::new();
        let transcript = vec![Message::assistant("Hi!"), Message::user("Cancel it")];
        let message = protocol
            .initial_user_message(&inputs(&[], &[], &[], &transcript))
            .unwrap();
        assert!(message.content.starts_with("The user spoke last."));
        assert!(message.content.contains("■im_start\nCancel it\n■im_end"));

        let empty = protocol.initial_user_message(&inputs(&[], &[], &[], &[])).unwrap();
        assert!(empty.content.starts_with("Nobody has spoken yet"));
    }

    #[test]
    fn test_corrective_messages_have_vm_header() {
        let protocol = FencedProtocol::new();
        let invalid = protocol.invalid_code_message("let = ;", "Unexpected '='");
        let runtime = protocol.execution_error_message("boom", "> 001 | boom()");
        let think = protocol.thinking_message(&ThinkSignal {
            reason: "check".to_string(),
            context: Some(json!({"total": 42})),
        });
        for message in [&invalid, &runtime, &think] {
            assert!(message.content.starts_with(VM_MESSAGE_HEADER));
            assert_eq!(message.name.as_deref(), Some("VM"));
            assert_eq!(message.role, Role::User);
        }
        assert!(strip_markers(&invalid.content).contains("Unexpected '='"));
        assert!(strip_markers(&runtime.content).contains("> 001 | boom()"));
        assert!(strip_markers(&think.content).contains("Value of total is 42"));
        assert!(invalid.content.contains("【TRUNCATE"));
    }

    #[test]
    fn test_assistant_message_is_fenced() {
        let message = FencedProtocol::new().assistant_message("let a = 1;\n");
        assert_eq!(message.content, "■fn_start\nlet a = 1;\n■fn_end");
        assert_eq!(message.role, Role::Assistant);
    }

    #[test]
    fn test_snapshot_messages() {
        let mut signal = InterruptSignal::new("waiting");
        signal.stack = Some("  001 | let a = 1;\n> 002 | let r = slow(a);".to_string());
        let snapshot = Snapshot::from_interrupt(&signal, None);
        let protocol = FencedProtocol::new();

        let variables = BTreeMap::from([("a".to_string(), json!(1))]);
        let resolved = strip_markers(&protocol.snapshot_resolved_message(&snapshot, &json!("done"), &variables).content);
        assert!(resolved.starts_with(VM_MESSAGE_HEADER));
        assert!(resolved.contains("  001 | let a = 1;"));
        assert!(!resolved.contains("> 002"));
        assert!(resolved.contains("\"done\""));
        assert!(resolved.contains("Variable \"a\" restored"));

        let rejected = strip_markers(&protocol.snapshot_rejected_message(&snapshot, "denied").content);
        assert!(rejected.contains("Here's the error:\ndenied"));
        assert!(rejected.contains("// waiting"));
    }
}
