//! Value bridging between host JSON and sandbox values
//!
//! Each backend supplies a [`HostBinding`]. The loop and the classifier only
//! ever see JSON; everything Rhai-specific stays behind this trait.

use std::sync::{Arc, Mutex, MutexGuard};

use rhai::{Array, Dynamic, FnPtr, Map};
use serde_json::Value;

use crate::objects::{ObjectError, ObjectMirror};

/// Converts values across the sandbox boundary for one backend
pub trait HostBinding: Copy + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn to_sandbox(&self, value: &Value) -> Dynamic;

    fn from_sandbox(&self, value: &Dynamic) -> Value;

    fn is_function(&self, value: &Dynamic) -> bool {
        value.is::<FnPtr>()
    }

    /// True for values scripts may change but never extend
    fn is_sealed(&self, value: &Dynamic) -> bool {
        value.is::<SealedRecord>() || value.is::<ObjectHandle>()
    }

    /// Injected global: a top-level JSON object becomes a [`SealedRecord`]
    fn to_global(&self, name: &str, value: &Value) -> Dynamic {
        match value {
            Value::Object(map) => Dynamic::from(SealedRecord::new(name, map.clone())),
            other => self.to_sandbox(other),
        }
    }
}

/// Direct conversion for scripts running in-process
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineBinding;

impl HostBinding for InlineBinding {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn to_sandbox(&self, value: &Value) -> Dynamic {
        json_to_dynamic(value)
    }

    fn from_sandbox(&self, value: &Dynamic) -> Value {
        dynamic_to_json(value)
    }
}

/// Conversion through serialized bytes, so nothing is shared by reference
#[derive(Debug, Clone, Copy, Default)]
pub struct IsolatedBinding;

impl IsolatedBinding {
    fn through_bytes(value: &Value) -> Value {
        serde_json::to_vec(value)
            .and_then(|bytes| serde_json::from_slice(&bytes))
            .unwrap_or_else(|e| {
                log::warn!("Dropping value that failed to cross the sandbox boundary: {}", e);
                Value::Null
            })
    }
}

impl HostBinding for IsolatedBinding {
    fn name(&self) -> &'static str {
        "isolated"
    }

    fn to_sandbox(&self, value: &Value) -> Dynamic {
        json_to_dynamic(&Self::through_bytes(value))
    }

    fn from_sandbox(&self, value: &Dynamic) -> Value {
        Self::through_bytes(&dynamic_to_json(value))
    }
}

pub(crate) fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => Dynamic::from(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(json_to_dynamic).collect()),
        Value::Object(fields) => {
            let mut map = Map::new();
            for (key, item) in fields {
                map.insert(key.as_str().into(), json_to_dynamic(item));
            }
            Dynamic::from_map(map)
        }
    }
}

pub(crate) fn dynamic_to_json(value: &Dynamic) -> Value {
    let value = value.flatten_clone();
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::from(i);
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if value.is_string() {
        return Value::String(value.into_string().unwrap_or_default());
    }
    if value.is::<Array>() {
        let items = value.cast::<Array>();
        return Value::Array(items.iter().map(dynamic_to_json).collect());
    }
    if value.is::<Map>() {
        let map = value.cast::<Map>();
        return Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        );
    }
    if let Some(record) = value.clone().try_cast::<SealedRecord>() {
        return record.to_value();
    }
    if let Some(handle) = value.clone().try_cast::<ObjectHandle>() {
        return Value::Object(handle.mirror().values());
    }
    Value::String(format!("[[{}]]", value.type_name()))
}

/// Sandbox view of a host plain object
///
/// Existing keys can be read and written; adding a key fails. Clones share
/// storage, so every alias in the script sees the same fields.
#[derive(Debug, Clone)]
pub struct SealedRecord {
    name: String,
    fields: Arc<Mutex<serde_json::Map<String, Value>>>,
}

impl SealedRecord {
    pub fn new(name: impl Into<String>, fields: serde_json::Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            fields: Arc::new(Mutex::new(fields)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, serde_json::Map<String, Value>> {
        self.fields.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), ObjectError> {
        let mut fields = self.lock();
        match fields.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ObjectError::UnknownProperty {
                object: self.name.clone(),
                property: key.to_string(),
            }),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.lock().clone())
    }
}

/// Sandbox view of an object instance
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    mirror: ObjectMirror,
}

impl ObjectHandle {
    pub fn new(mirror: ObjectMirror) -> Self {
        Self { mirror }
    }

    pub fn mirror(&self) -> &ObjectMirror {
        &self.mirror
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TraceSink;
    use crate::objects::{ObjectInstance, ObjectProperty};
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "name": "Ada",
            "age": 36,
            "score": 1.5,
            "tags": ["a", "b"],
            "address": {"city": "London", "zip": null},
            "active": true
        })
    }

    #[test]
    fn test_inline_roundtrip() {
        let binding = InlineBinding;
        let value = sample();
        assert_eq!(binding.from_sandbox(&binding.to_sandbox(&value)), value);
    }

    #[test]
    fn test_isolated_roundtrip_matches_inline() {
        let value = sample();
        let inline = InlineBinding.from_sandbox(&InlineBinding.to_sandbox(&value));
        let isolated = IsolatedBinding.from_sandbox(&IsolatedBinding.to_sandbox(&value));
        assert_eq!(inline, isolated);
    }

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(dynamic_to_json(&Dynamic::UNIT), Value::Null);
        assert_eq!(dynamic_to_json(&Dynamic::from('x')), json!("x"));
        assert_eq!(dynamic_to_json(&Dynamic::from(2_i64)), json!(2));
        assert_eq!(dynamic_to_json(&Dynamic::from(f64::NAN)), Value::Null);
        assert!(json_to_dynamic(&json!(3)).is_int());
    }

    #[test]
    fn test_to_global_seals_objects() {
        let binding = InlineBinding;
        let global = binding.to_global("profile", &json!({"name": "Ada"}));
        assert!(binding.is_sealed(&global));
        let plain = binding.to_global("count", &json!(3));
        assert!(!binding.is_sealed(&plain));
        assert_eq!(binding.from_sandbox(&global), json!({"name": "Ada"}));
    }

    #[test]
    fn test_sealed_record_rejects_new_keys() {
        let record = SealedRecord::new("profile", serde_json::Map::from_iter([(
            "name".to_string(),
            json!("Ada"),
        )]));
        record.set("name", json!("Grace")).unwrap();
        assert_eq!(record.get("name"), Some(json!("Grace")));

        let err = record.set("email", json!("x")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot add property email to sealed object profile"
        );
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_sealed_record_clones_share_fields() {
        let record = SealedRecord::new("r", serde_json::Map::from_iter([("a".to_string(), json!(1))]));
        let alias = record.clone();
        alias.set("a", json!(2)).unwrap();
        assert_eq!(record.get("a"), Some(json!(2)));
    }

    #[test]
    fn test_object_handle_converts_to_values() {
        let instance = ObjectInstance::builder("user")
            .property(ObjectProperty::new("name", json!("Ada")))
            .build()
            .unwrap();
        let handle = ObjectHandle::new(ObjectMirror::new(&instance, TraceSink::new()));
        let value = InlineBinding.from_sandbox(&Dynamic::from(handle));
        assert_eq!(value, json!({"name": "Ada"}));
    }
}
