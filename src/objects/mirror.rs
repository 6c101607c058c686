//! Per-execution object mirrors
//!
//! A mirror is copied from an [`ObjectInstance`] when an execution starts
//! and its mutations are copied back when it ends. Scripts only ever touch
//! the mirror, so nothing crosses the sandbox boundary by reference.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};

use super::{ObjectError, ObjectInstance, ObjectMutation, ObjectProperty};
use crate::domain::{Trace, TraceSink};
use crate::id::now_ms;
use crate::tools::{ToolImplementation, schema};

#[derive(Debug)]
struct MirrorState {
    properties: Vec<ObjectProperty>,
    initial: BTreeMap<String, Value>,
    mutations: Vec<ObjectMutation>,
}

/// Mutation-tracking copy of an object for one execution
#[derive(Debug, Clone)]
pub struct ObjectMirror {
    name: String,
    tools: Vec<ToolImplementation>,
    state: Arc<Mutex<MirrorState>>,
    traces: TraceSink,
}

impl ObjectMirror {
    pub fn new(instance: &ObjectInstance, traces: TraceSink) -> Self {
        let properties = instance.properties().to_vec();
        let initial = properties
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        Self {
            name: instance.name().to_string(),
            tools: instance.tools().to_vec(),
            state: Arc::new(Mutex::new(MirrorState {
                properties,
                initial,
                mutations: Vec::new(),
            })),
            traces,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound tool reachable under `name` or one of its aliases
    pub fn tool(&self, name: &str) -> Option<&ToolImplementation> {
        self.tools.iter().find(|t| t.matches(name))
    }

    pub fn tools(&self) -> &[ToolImplementation] {
        &self.tools
    }

    pub fn has_property(&self, property: &str) -> bool {
        self.lock().properties.iter().any(|p| p.name == property)
    }

    pub fn get(&self, property: &str) -> Result<Value, ObjectError> {
        self.lock()
            .properties
            .iter()
            .find(|p| p.name == property)
            .map(|p| p.value.clone())
            .ok_or_else(|| ObjectError::UnknownProperty {
                object: self.name.clone(),
                property: property.to_string(),
            })
    }

    /// Write a property from script code
    ///
    /// Schema defaults are filled in before the value is stored. Returns
    /// whether the stored value changed. An identical value is a no-op; a
    /// rejected write leaves the stored value untouched.
    pub fn set(&self, property: &str, value: Value) -> Result<bool, ObjectError> {
        let mut state = self.lock();
        let Some(slot) = state.properties.iter_mut().find(|p| p.name == property) else {
            return Err(ObjectError::UnknownProperty {
                object: self.name.clone(),
                property: property.to_string(),
            });
        };
        if !slot.writable {
            return Err(ObjectError::ReadOnly {
                object: self.name.clone(),
                property: property.to_string(),
            });
        }
        let value = match &slot.schema {
            Some(s) => schema::parse(s, &value).map_err(|source| ObjectError::SchemaViolation {
                object: self.name.clone(),
                property: property.to_string(),
                source,
            })?,
            None => value,
        };
        if schema::values_equal(&slot.value, &value) {
            return Ok(false);
        }
        slot.value = value.clone();

        let before = state.initial.get(property).cloned().unwrap_or(Value::Null);
        match state.mutations.iter_mut().find(|m| m.property == property) {
            Some(existing) => existing.after = value.clone(),
            None => state.mutations.push(ObjectMutation {
                object: self.name.clone(),
                property: property.to_string(),
                before,
                after: value.clone(),
            }),
        }
        drop(state);

        self.traces.push(Trace::Property {
            started_at: now_ms(),
            object: self.name.clone(),
            property: property.to_string(),
            value,
        });
        Ok(true)
    }

    /// Current values keyed by property name
    pub fn values(&self) -> Map<String, Value> {
        self.lock()
            .properties
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }

    /// One live mutation per changed property, in first-write order
    pub fn mutations(&self) -> Vec<ObjectMutation> {
        self.lock().mutations.clone()
    }
}
