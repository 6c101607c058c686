//! Object instances
//!
//! An [`ObjectInstance`] is sealed at construction: the builder validates
//! the property set once and nothing can add or remove a property later.
//! Only values change, and only through mutations reconciled from a mirror.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MAX_PROPERTIES, ObjectError, ObjectMutation};
use crate::compiler::is_identifier;
use crate::tools::{ToolImplementation, schema};

/// One declared property of an object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectProperty {
    pub name: String,
    pub value: Value,
    #[serde(default = "default_writable")]
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_writable() -> bool {
    true
}

impl ObjectProperty {
    /// Create a writable property
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            writable: true,
            schema: None,
            description: None,
        }
    }

    /// Create a property scripts can read but never write
    pub fn readonly(name: impl Into<String>, value: Value) -> Self {
        Self {
            writable: false,
            ..Self::new(name, value)
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A sealed, schema-validated stateful object exposed to scripts
#[derive(Debug, Clone)]
pub struct ObjectInstance {
    name: String,
    description: Option<String>,
    properties: Vec<ObjectProperty>,
    tools: Vec<ToolImplementation>,
}

impl ObjectInstance {
    pub fn builder(name: impl Into<String>) -> ObjectInstanceBuilder {
        ObjectInstanceBuilder {
            name: name.into(),
            description: None,
            properties: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn properties(&self) -> &[ObjectProperty] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&ObjectProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Current value of a property
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.property(name).map(|p| &p.value)
    }

    pub fn tools(&self) -> &[ToolImplementation] {
        &self.tools
    }

    /// Copy mutated values back in; mutations for other objects are ignored
    pub fn reconcile(&mut self, mutations: &[ObjectMutation]) {
        for mutation in mutations.iter().filter(|m| m.object == self.name) {
            if let Some(property) = self
                .properties
                .iter_mut()
                .find(|p| p.name == mutation.property)
            {
                property.value = mutation.after.clone();
            }
        }
    }

    /// Description of the object as shown to the model
    pub fn describe(&self) -> Value {
        let properties: Vec<Value> = self
            .properties
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "value": p.value,
                    "writable": p.writable,
                    "schema": p.schema,
                    "description": p.description,
                })
            })
            .collect();
        let tools: Vec<Value> = self.tools.iter().map(ToolImplementation::describe).collect();
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "properties": properties,
            "tools": tools,
        })
    }
}

/// Collects the parts of an [`ObjectInstance`] and seals them
#[derive(Debug)]
pub struct ObjectInstanceBuilder {
    name: String,
    description: Option<String>,
    properties: Vec<ObjectProperty>,
    tools: Vec<ToolImplementation>,
}

impl ObjectInstanceBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn property(mut self, property: ObjectProperty) -> Self {
        self.properties.push(property);
        self
    }

    pub fn tool(mut self, tool: ToolImplementation) -> Self {
        self.tools.push(tool);
        self
    }

    /// Validate and seal the object
    pub fn build(self) -> Result<ObjectInstance, ObjectError> {
        if !is_identifier(&self.name) {
            return Err(ObjectError::InvalidName(self.name));
        }
        if self.properties.len() > MAX_PROPERTIES {
            return Err(ObjectError::TooManyProperties {
                object: self.name,
                count: self.properties.len(),
            });
        }

        let mut seen: Vec<&str> = Vec::new();
        for property in &self.properties {
            if !is_identifier(&property.name) {
                return Err(ObjectError::InvalidName(format!(
                    "{}.{}",
                    self.name, property.name
                )));
            }
            if seen.contains(&property.name.as_str()) {
                return Err(ObjectError::DuplicateMember {
                    object: self.name.clone(),
                    member: property.name.clone(),
                });
            }
            seen.push(&property.name);

            if let Some(s) = &property.schema {
                schema::validate(s, &property.value).map_err(|source| {
                    ObjectError::SchemaViolation {
                        object: self.name.clone(),
                        property: property.name.clone(),
                        source,
                    }
                })?;
            }
        }

        for tool in &self.tools {
            for name in tool.names() {
                if seen.contains(&name) {
                    return Err(ObjectError::DuplicateMember {
                        object: self.name.clone(),
                        member: name.to_string(),
                    });
                }
                seen.push(name);
            }
        }

        Ok(ObjectInstance {
            name: self.name,
            description: self.description,
            properties: self.properties,
            tools: self.tools,
        })
    }
}
