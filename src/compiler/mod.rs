//! Script compilation
//!
//! A [`Compiler`] turns model-written script text into [`CompiledCode`]: the
//! instrumented text the VM runs, a [`SourceMap`] back to the original, the
//! top-level identifiers worth tracking, and the tool-call sites whose
//! results are assigned to a variable.

mod instrument;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ToolCallAssignment;

pub use instrument::ScriptCompiler;

/// Instrumentation hooks and built-ins no tool, object or exit may shadow
pub const RESERVED_IDENTIFIERS: &[&str] = &[
    "__track_line",
    "__record_comment",
    "__track_tool_call",
    "__yield",
    "console",
    "think",
    "listen",
    "transition",
    "execute",
    "interrupt",
    "print",
    "debug",
];

/// Script keywords that can never be used as names
const KEYWORDS: &[&str] = &[
    "let", "const", "if", "else", "switch", "do", "while", "loop", "until", "for", "in", "break",
    "continue", "return", "throw", "try", "catch", "fn", "private", "import", "export", "as",
    "true", "false", "this", "global", "yield", "Fn", "call", "curry", "type_of", "is_def_var",
    "is_def_fn", "is_shared",
];

/// True when `name` is a plain identifier that is not a keyword
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.chars().any(|c| c.is_ascii_alphanumeric())
        && !KEYWORDS.contains(&name)
}

/// True when `name` collides with instrumentation or a built-in
pub fn is_reserved(name: &str) -> bool {
    RESERVED_IDENTIFIERS.contains(&name)
}

/// The script could not be compiled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message} (line {line}, column {column})")]
pub struct CompileError {
    pub message: String,
    /// 1-based line in the original script
    pub line: u32,
    pub column: u32,
}

/// Maps instrumented positions back to the original script
///
/// Instrumentation never adds or removes lines, it only inserts a prefix
/// after a line's indentation. Each entry records where that prefix starts
/// and how long it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMap {
    lines: Vec<(u32, u32)>,
}

impl SourceMap {
    /// Map with no inserted prefixes
    pub fn identity(line_count: usize) -> Self {
        Self {
            lines: vec![(0, 0); line_count],
        }
    }

    pub(crate) fn push(&mut self, indent: u32, prefix: u32) {
        self.lines.push((indent, prefix));
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Original 1-based column for an instrumented position
    pub fn original_column(&self, line: u32, column: u32) -> u32 {
        let Some(&(indent, prefix)) = self.lines.get(line.saturating_sub(1) as usize) else {
            return column;
        };
        if column > indent + prefix {
            column - prefix
        } else {
            column.min(indent + 1).max(1)
        }
    }
}

/// Output of a successful compilation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledCode {
    /// Script as the model wrote it
    pub source: String,
    /// Script as the VM runs it
    pub code: String,
    pub source_map: SourceMap,
    /// Top-level names declared or assigned by the script
    pub variables: BTreeSet<String>,
    /// Subset of `variables` introduced with `let` or `const`
    pub declared: BTreeSet<String>,
    /// Tracked call sites keyed by the id passed to `__track_tool_call`
    pub tool_calls: BTreeMap<u32, ToolCallAssignment>,
}

impl CompiledCode {
    /// Compiled form of a script that needs no instrumentation
    pub fn plain(source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            code: source.clone(),
            source_map: SourceMap::identity(source.lines().count()),
            source,
            variables: BTreeSet::new(),
            declared: BTreeSet::new(),
            tool_calls: BTreeMap::new(),
        }
    }
}

/// Compiles script text for the VM
pub trait Compiler: Send + Sync {
    fn compile(&self, code: &str) -> Result<CompiledCode, CompileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("user"));
        assert!(is_identifier("get_user2"));
        assert!(is_identifier("_private"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("_"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("first-name"));
        assert!(!is_identifier("let"));
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("__track_line"));
        assert!(is_reserved("think"));
        assert!(is_reserved("console"));
        assert!(!is_reserved("getUser"));
    }

    #[test]
    fn test_source_map_original_column() {
        let mut map = SourceMap::default();
        map.push(4, 18);
        assert_eq!(map.original_column(1, 23), 5);
        assert_eq!(map.original_column(1, 30), 12);
        assert_eq!(map.original_column(1, 10), 5);
        assert_eq!(map.original_column(9, 7), 7);
    }

    #[test]
    fn test_compile_error_display() {
        let err = CompileError {
            message: "Expecting ';'".to_string(),
            line: 2,
            column: 7,
        };
        assert_eq!(err.to_string(), "Expecting ';' (line 2, column 7)");
    }

    #[test]
    fn test_plain_compiled_code() {
        let compiled = CompiledCode::plain("let a = 1;\nlet b = 2;");
        assert_eq!(compiled.code, compiled.source);
        assert_eq!(compiled.source_map.line_count(), 2);
        assert!(compiled.tool_calls.is_empty());
    }
}
