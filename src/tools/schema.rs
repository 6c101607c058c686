//! JSON Schema validation for tool inputs, object properties and exits.
//!
//! Covers the subset of JSON Schema that tool and property definitions use
//! in practice: `type`, `enum`, `const`, `anyOf`/`oneOf`, object
//! `properties`/`required`/`additionalProperties`, array `items` and
//! length bounds, string length bounds, and numeric ranges. Unknown
//! keywords are ignored.

use serde_json::{Map, Value};
use thiserror::Error;

/// A value did not satisfy a schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct SchemaError {
    /// JSON-path-like location of the failing value, rooted at `$`
    pub path: String,
    pub message: String,
}

impl SchemaError {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Validate `value` against `schema`
pub fn validate(schema: &Value, value: &Value) -> Result<(), SchemaError> {
    validate_at(schema, value, "$")
}

/// Fill schema defaults into `value`, then validate the result
pub fn parse(schema: &Value, value: &Value) -> Result<Value, SchemaError> {
    let filled = apply_defaults(schema, value);
    validate(schema, &filled)?;
    Ok(filled)
}

/// Deep equality that treats `1` and `1.0` as the same number
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), SchemaError> {
    let rules = match schema {
        Value::Bool(false) => return Err(SchemaError::new(path, "no value is allowed here")),
        Value::Object(rules) => rules,
        _ => return Ok(()),
    };

    for key in ["anyOf", "oneOf"] {
        if let Some(options) = rules.get(key).and_then(Value::as_array)
            && !options.iter().any(|s| validate_at(s, value, path).is_ok())
        {
            return Err(SchemaError::new(path, "does not match any allowed schema"));
        }
    }

    if let Some(expected) = rules.get("type") {
        let names: Vec<&str> = match expected {
            Value::String(name) => vec![name.as_str()],
            Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !names.is_empty() && !names.iter().any(|name| type_matches(name, value)) {
            return Err(SchemaError::new(
                path,
                format!("expected {}, got {}", names.join(" or "), type_name(value)),
            ));
        }
    }

    if let Some(allowed) = rules.get("enum").and_then(Value::as_array)
        && !allowed.iter().any(|a| values_equal(a, value))
    {
        let choices: Vec<String> = allowed.iter().map(Value::to_string).collect();
        return Err(SchemaError::new(
            path,
            format!("must be one of {}", choices.join(", ")),
        ));
    }

    if let Some(constant) = rules.get("const")
        && !values_equal(constant, value)
    {
        return Err(SchemaError::new(path, format!("must equal {}", constant)));
    }

    match value {
        Value::Number(n) => check_number(rules, n.as_f64().unwrap_or(0.0), path),
        Value::String(s) => check_string(rules, s, path),
        Value::Array(items) => check_array(rules, items, path),
        Value::Object(map) => check_object(rules, map, path),
        _ => Ok(()),
    }
}

fn check_number(rules: &Map<String, Value>, n: f64, path: &str) -> Result<(), SchemaError> {
    if let Some(min) = rules.get("minimum").and_then(Value::as_f64)
        && n < min
    {
        return Err(SchemaError::new(path, format!("must be >= {}", min)));
    }
    if let Some(max) = rules.get("maximum").and_then(Value::as_f64)
        && n > max
    {
        return Err(SchemaError::new(path, format!("must be <= {}", max)));
    }
    if let Some(min) = rules.get("exclusiveMinimum").and_then(Value::as_f64)
        && n <= min
    {
        return Err(SchemaError::new(path, format!("must be > {}", min)));
    }
    if let Some(max) = rules.get("exclusiveMaximum").and_then(Value::as_f64)
        && n >= max
    {
        return Err(SchemaError::new(path, format!("must be < {}", max)));
    }
    Ok(())
}

fn check_string(rules: &Map<String, Value>, s: &str, path: &str) -> Result<(), SchemaError> {
    let len = s.chars().count() as u64;
    if let Some(min) = rules.get("minLength").and_then(Value::as_u64)
        && len < min
    {
        return Err(SchemaError::new(path, format!("must be at least {} characters", min)));
    }
    if let Some(max) = rules.get("maxLength").and_then(Value::as_u64)
        && len > max
    {
        return Err(SchemaError::new(path, format!("must be at most {} characters", max)));
    }
    Ok(())
}

fn check_array(rules: &Map<String, Value>, items: &[Value], path: &str) -> Result<(), SchemaError> {
    let len = items.len() as u64;
    if let Some(min) = rules.get("minItems").and_then(Value::as_u64)
        && len < min
    {
        return Err(SchemaError::new(path, format!("must have at least {} items", min)));
    }
    if let Some(max) = rules.get("maxItems").and_then(Value::as_u64)
        && len > max
    {
        return Err(SchemaError::new(path, format!("must have at most {} items", max)));
    }
    if let Some(item_schema) = rules.get("items") {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{}[{}]", path, i))?;
        }
    }
    Ok(())
}

fn check_object(
    rules: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaError> {
    if let Some(required) = rules.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(field) {
                return Err(SchemaError::new(
                    path,
                    format!("missing required field: {}", field),
                ));
            }
        }
    }

    let properties = rules.get("properties").and_then(Value::as_object);
    for (key, item) in map {
        let child = format!("{}.{}", path, key);
        match properties.and_then(|p| p.get(key)) {
            Some(prop_schema) => validate_at(prop_schema, item, &child)?,
            None => match rules.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    return Err(SchemaError::new(path, format!("unexpected field: {}", key)));
                }
                Some(extra @ Value::Object(_)) => validate_at(extra, item, &child)?,
                _ => {}
            },
        }
    }
    Ok(())
}

fn apply_defaults(schema: &Value, value: &Value) -> Value {
    let Some(rules) = schema.as_object() else {
        return value.clone();
    };

    if value.is_null()
        && let Some(default) = rules.get("default")
    {
        return default.clone();
    }

    match (value, rules.get("properties").and_then(Value::as_object)) {
        (Value::Object(map), Some(properties)) => {
            let mut filled = map.clone();
            for (key, prop_schema) in properties {
                match filled.get(key) {
                    Some(current) => {
                        let next = apply_defaults(prop_schema, current);
                        filled.insert(key.clone(), next);
                    }
                    None => {
                        if let Some(default) = prop_schema.get("default") {
                            filled.insert(key.clone(), default.clone());
                        }
                    }
                }
            }
            Value::Object(filled)
        }
        _ => value.clone(),
    }
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            _ => false,
        },
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "minLength": 1},
                "age": {"type": "integer", "minimum": 0, "maximum": 150},
                "tier": {"type": "string", "enum": ["free", "pro"], "default": "free"}
            },
            "required": ["name"],
            "additionalProperties": false
        })
    }

    #[test]
    fn test_validate_accepts_matching_value() {
        assert!(validate(&user_schema(), &json!({"name": "Ada", "age": 36})).is_ok());
    }

    #[test]
    fn test_validate_missing_required() {
        let err = validate(&user_schema(), &json!({"age": 3})).unwrap_err();
        assert_eq!(err.path, "$");
        assert!(err.message.contains("missing required field: name"));
    }

    #[test]
    fn test_validate_reports_nested_path() {
        let err = validate(&user_schema(), &json!({"name": "Ada", "age": -1})).unwrap_err();
        assert_eq!(err.path, "$.age");
        assert_eq!(err.to_string(), "$.age: must be >= 0");
    }

    #[test]
    fn test_validate_rejects_additional_properties() {
        let err = validate(&user_schema(), &json!({"name": "Ada", "admin": true})).unwrap_err();
        assert!(err.message.contains("unexpected field: admin"));
    }

    #[test]
    fn test_validate_type_union_and_enum() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate(&schema, &json!(null)).is_ok());
        assert!(validate(&schema, &json!(3)).is_err());

        let err = validate(&user_schema(), &json!({"name": "Ada", "tier": "gold"})).unwrap_err();
        assert!(err.message.starts_with("must be one of"));
    }

    #[test]
    fn test_validate_integer_accepts_whole_float() {
        assert!(validate(&json!({"type": "integer"}), &json!(4.0)).is_ok());
        assert!(validate(&json!({"type": "integer"}), &json!(4.5)).is_err());
    }

    #[test]
    fn test_validate_array_items() {
        let schema = json!({"type": "array", "items": {"type": "number"}, "maxItems": 2});
        assert!(validate(&schema, &json!([1, 2])).is_ok());
        let err = validate(&schema, &json!([1, "x"])).unwrap_err();
        assert_eq!(err.path, "$[1]");
        assert!(validate(&schema, &json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_any_of() {
        let schema = json!({"anyOf": [{"type": "string"}, {"type": "number", "minimum": 10}]});
        assert!(validate(&schema, &json!("x")).is_ok());
        assert!(validate(&schema, &json!(12)).is_ok());
        assert!(validate(&schema, &json!(5)).is_err());
    }

    #[test]
    fn test_parse_fills_defaults() {
        let parsed = parse(&user_schema(), &json!({"name": "Ada"})).unwrap();
        assert_eq!(parsed["tier"], "free");
    }

    #[test]
    fn test_empty_schema_accepts_anything() {
        assert!(validate(&json!({}), &json!({"x": [1, 2]})).is_ok());
        assert!(validate(&json!(true), &json!(null)).is_ok());
        assert!(validate(&json!(false), &json!(null)).is_err());
    }

    #[test]
    fn test_values_equal_normalizes_numbers() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({"a": [1, 2]}), &json!({"a": [1.0, 2]})));
        assert!(!values_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!values_equal(&json!("1"), &json!(1)));
    }
}
