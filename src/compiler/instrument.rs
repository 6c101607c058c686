//! Line-based instrumentation of Rhai scripts
//!
//! The compiler walks the script one line at a time, tracking brackets,
//! strings and comments just well enough to know whether a line begins a
//! statement. Statement lines get a `__track_line(n);` prefix, and a
//! `__track_tool_call(k);` prefix when they assign the result of a call.
//! Full-line comments become `__record_comment(..)` calls and `yield x;`
//! becomes `__yield(x);`. Line numbers never move.
//!
//! When the instrumented text does not parse but the plain rewrite does,
//! the plain rewrite runs without line tracking.

use std::collections::{BTreeMap, BTreeSet};

use rhai::Engine;

use super::{CompileError, CompiledCode, Compiler, SourceMap, is_identifier};
use crate::domain::ToolCallAssignment;

/// Default compiler for Rhai scripts
#[derive(Debug, Clone, Default)]
pub struct ScriptCompiler {
    _private: (),
}

impl ScriptCompiler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Compiler for ScriptCompiler {
    fn compile(&self, code: &str) -> Result<CompiledCode, CompileError> {
        let engine = Engine::new_raw();
        let rewrite = instrument(code);

        match engine.compile(&rewrite.instrumented) {
            Ok(_) => Ok(CompiledCode {
                source: code.to_string(),
                code: rewrite.instrumented,
                source_map: rewrite.source_map,
                variables: rewrite.declared.union(&rewrite.assigned).cloned().collect(),
                declared: rewrite.declared,
                tool_calls: rewrite.tool_calls,
            }),
            Err(instrumented_err) => match engine.compile(&rewrite.plain) {
                Ok(_) => {
                    log::warn!(
                        "Instrumented script failed to parse ({}), running without line tracking",
                        instrumented_err
                    );
                    Ok(CompiledCode {
                        source: code.to_string(),
                        code: rewrite.plain,
                        source_map: SourceMap::identity(code.lines().count()),
                        variables: rewrite.declared.union(&rewrite.assigned).cloned().collect(),
                        declared: rewrite.declared,
                        tool_calls: BTreeMap::new(),
                    })
                }
                Err(err) => {
                    log::debug!("Script failed to compile: {}", err);
                    Err(CompileError {
                        message: err.0.to_string(),
                        line: err.1.line().unwrap_or(0) as u32,
                        column: err.1.position().unwrap_or(0) as u32,
                    })
                }
            },
        }
    }
}

struct Rewrite {
    instrumented: String,
    plain: String,
    source_map: SourceMap,
    declared: BTreeSet<String>,
    assigned: BTreeSet<String>,
    tool_calls: BTreeMap<u32, ToolCallAssignment>,
}

fn instrument(code: &str) -> Rewrite {
    let mut scanner = Scanner::default();
    let mut instrumented = Vec::new();
    let mut plain = Vec::new();
    let mut source_map = SourceMap::default();
    let mut declared = BTreeSet::new();
    let mut assigned = BTreeSet::new();
    let mut tool_calls = BTreeMap::new();
    let mut next_call = 0u32;

    for (idx, line) in code.lines().enumerate() {
        let n = idx as u32 + 1;
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];
        let mut out = line.to_string();
        let mut plain_line = line.to_string();
        let mut prefix_len = 0;

        if scanner.at_statement_start() && !trimmed.is_empty() {
            if let Some(comment) = trimmed.strip_prefix("//") {
                let text = comment.trim_start_matches('/').trim();
                out = format!("{}__record_comment({}, {});", indent, quote(text), n);
            } else if let Some(expr) = yield_expression(trimmed) {
                plain_line = format!("{}__yield({});", indent, expr);
                let prefix = format!("__track_line({}); ", n);
                prefix_len = prefix.len();
                out = format!("{}{}__yield({});", indent, prefix, expr);
            } else if begins_statement(trimmed) {
                let mut prefix = format!("__track_line({}); ", n);
                if let Some((variable, callee)) = call_assignment(trimmed) {
                    next_call += 1;
                    prefix.push_str(&format!("__track_tool_call({}); ", next_call));
                    tool_calls.insert(
                        next_call,
                        ToolCallAssignment {
                            variable,
                            callee,
                            line: n,
                        },
                    );
                }
                prefix_len = prefix.len();
                out = format!("{}{}{}", indent, prefix, trimmed);
            }

            if scanner.depth() == 0
                && let Some(name) = declaration(trimmed)
            {
                declared.insert(name);
            }
            if let Some(name) = assignment_target(trimmed) {
                assigned.insert(name);
            }
        }

        scanner.scan(line);
        source_map.push(indent.len() as u32, prefix_len as u32);
        instrumented.push(out);
        plain.push(plain_line);
    }

    Rewrite {
        instrumented: instrumented.join("\n"),
        plain: plain.join("\n"),
        source_map,
        declared,
        assigned,
        tool_calls,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bracket {
    Block,
    Map,
    Switch,
    Array,
    Paren,
}

/// Bracket, string and comment state carried from line to line
#[derive(Debug)]
struct Scanner {
    stack: Vec<Bracket>,
    in_block_comment: bool,
    in_backtick: bool,
    statement_ended: bool,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            stack: Vec::new(),
            in_block_comment: false,
            in_backtick: false,
            statement_ended: true,
        }
    }
}

impl Scanner {
    fn depth(&self) -> usize {
        self.stack.len()
    }

    fn at_statement_start(&self) -> bool {
        !self.in_block_comment
            && !self.in_backtick
            && self.statement_ended
            && matches!(self.stack.last(), None | Some(Bracket::Block))
    }

    fn scan(&mut self, line: &str) {
        let chars: Vec<char> = line.chars().collect();
        let mut ends: Option<bool> = None;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            if self.in_block_comment {
                if c == '*' && next == Some('/') {
                    self.in_block_comment = false;
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }
            if self.in_backtick {
                match c {
                    '\\' => i += 2,
                    '`' => {
                        self.in_backtick = false;
                        ends = Some(false);
                        i += 1;
                    }
                    _ => i += 1,
                }
                continue;
            }

            match c {
                '/' if next == Some('/') => break,
                '/' if next == Some('*') => {
                    self.in_block_comment = true;
                    i += 2;
                    continue;
                }
                '"' | '\'' => {
                    i = skip_quoted(&chars, i);
                    ends = Some(false);
                    continue;
                }
                '`' => {
                    self.in_backtick = true;
                    i += 1;
                    continue;
                }
                '{' => {
                    let kind = if previous_significant(&chars[..i]) == Some('#') {
                        Bracket::Map
                    } else if opens_switch(&chars[..i]) {
                        Bracket::Switch
                    } else {
                        Bracket::Block
                    };
                    self.stack.push(kind);
                    ends = Some(kind == Bracket::Block);
                }
                '[' => {
                    self.stack.push(Bracket::Array);
                    ends = Some(false);
                }
                '(' => {
                    self.stack.push(Bracket::Paren);
                    ends = Some(false);
                }
                '}' => {
                    let closed = self.stack.pop();
                    ends = Some(matches!(closed, Some(Bracket::Block | Bracket::Switch)));
                }
                ']' | ')' => {
                    self.stack.pop();
                    ends = Some(false);
                }
                ';' => ends = Some(true),
                c if !c.is_whitespace() => ends = Some(false),
                _ => {}
            }
            i += 1;
        }

        if let Some(ended) = ends {
            self.statement_ended = ended;
        }
    }
}

fn skip_quoted(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    i
}

fn previous_significant(chars: &[char]) -> Option<char> {
    chars.iter().rev().find(|c| !c.is_whitespace()).copied()
}

fn opens_switch(prefix: &[char]) -> bool {
    let text: String = prefix.iter().collect();
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|word| word == "switch")
}

/// Lines that continue an expression or close a block are not statements
fn begins_statement(trimmed: &str) -> bool {
    let Some(first) = trimmed.chars().next() else {
        return false;
    };
    if "})].?+-*/%&|^<>=,:;".contains(first) {
        return false;
    }
    let word = leading_identifier(trimmed);
    !matches!(word, Some("else" | "catch"))
}

fn leading_identifier(text: &str) -> Option<&str> {
    let end = text
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(text.len());
    if end == 0 { None } else { Some(&text[..end]) }
}

/// Name introduced by `let NAME` or `const NAME`
fn declaration(trimmed: &str) -> Option<String> {
    let rest = trimmed
        .strip_prefix("let ")
        .or_else(|| trimmed.strip_prefix("const "))?;
    let name = leading_identifier(rest.trim_start())?;
    is_identifier(name).then(|| name.to_string())
}

/// Name assigned by `NAME = ..` or a compound assignment
fn assignment_target(trimmed: &str) -> Option<String> {
    let name = leading_identifier(trimmed)?;
    if !is_identifier(name) {
        return None;
    }
    let rest = trimmed[name.len()..].trim_start();
    let is_assignment = (rest.starts_with('=') && !rest.starts_with("==") && !rest.starts_with("=>"))
        || ["+=", "-=", "*=", "/=", "%=", "**=", "&=", "|=", "^=", "<<=", ">>="]
            .iter()
            .any(|op| rest.starts_with(op));
    is_assignment.then(|| name.to_string())
}

/// `(variable, callee)` for `let x = callee(..)` and `x = callee(..)`
fn call_assignment(trimmed: &str) -> Option<(String, String)> {
    let target = trimmed
        .strip_prefix("let ")
        .or_else(|| trimmed.strip_prefix("const "))
        .unwrap_or(trimmed)
        .trim_start();
    let variable = leading_identifier(target)?;
    if !is_identifier(variable) {
        return None;
    }
    let rest = target[variable.len()..].trim_start();
    let rest = rest.strip_prefix('=')?;
    if rest.starts_with('=') || rest.starts_with('>') {
        return None;
    }
    let rest = rest.trim_start();

    let callee_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(rest.len());
    let callee = &rest[..callee_len];
    let callee_ok = !callee.is_empty()
        && callee.split('.').all(is_identifier)
        && rest[callee_len..].starts_with('(');
    callee_ok.then(|| (variable.to_string(), callee.to_string()))
}

/// Expression of a single-line `yield expr;` statement
fn yield_expression(trimmed: &str) -> Option<&str> {
    let rest = trimmed.strip_prefix("yield")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let expr = rest.trim().strip_suffix(';')?.trim();
    (!expr.is_empty()).then_some(expr)
}

/// Script string literal for `text`
fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
