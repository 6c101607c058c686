//! Prompt Renderer - Render templates with context values using Handlebars

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{CodeloopError, Result};

/// Renders prompt templates using Handlebars templating
pub struct PromptRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    /// Create a new PromptRenderer with default settings
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        // Prompts are plain text, never HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    /// Render a template string; runs of blank lines collapse to one
    pub fn render<T: Serialize>(&self, template: &str, context: &T) -> Result<String> {
        let rendered = self
            .handlebars
            .render_template(template, context)
            .map_err(|e| CodeloopError::Protocol(format!("Failed to render template: {}", e)))?;
        Ok(collapse_blank_lines(&rendered))
    }
}

impl std::fmt::Debug for PromptRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRenderer").finish_non_exhaustive()
    }
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in text.lines() {
        let blank = line.trim().is_empty();
        if blank && out.last().is_some_and(|l| l.trim().is_empty()) {
            continue;
        }
        out.push(if blank { "" } else { line });
    }
    out.join("\n").trim().to_string()
}
