//! Named final actions a script may return

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::schema::{self, SchemaError};

/// A final action, e.g. `respond` or `escalate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exit {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Schema the returned `value` must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl Exit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            description: String::new(),
            schema: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Case-insensitive match on name or alias
    pub fn matches(&self, action: &str) -> bool {
        self.names().any(|n| n.eq_ignore_ascii_case(action))
    }

    /// Parse a returned value against the exit schema, filling defaults
    pub fn parse_value(&self, value: &Value) -> Result<Value, SchemaError> {
        match &self.schema {
            Some(schema) => schema::parse(schema, value),
            None => Ok(value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_case_insensitively() {
        let exit = Exit::new("respond").with_alias("reply");
        assert!(exit.matches("RESPOND"));
        assert!(exit.matches("Reply"));
        assert!(!exit.matches("escalate"));
    }

    #[test]
    fn test_parse_value_with_schema() {
        let exit = Exit::new("respond").with_schema(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }));
        assert!(exit.parse_value(&json!({"text": "hi"})).is_ok());
        let err = exit.parse_value(&json!({"text": 3})).unwrap_err();
        assert!(err.to_string().contains("text"));
    }

    #[test]
    fn test_parse_value_without_schema_passes_through() {
        let exit = Exit::new("done");
        assert_eq!(exit.parse_value(&json!([1, 2])).unwrap(), json!([1, 2]));
    }
}
