//! Object instances - sealed, schema-validated state exposed to scripts
//!
//! Scripts see a per-execution [`ObjectMirror`]; changes flow back into the
//! host [`ObjectInstance`] as [`ObjectMutation`]s once execution ends.

mod instance;
mod mirror;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::SchemaError;

pub use instance::{ObjectInstance, ObjectInstanceBuilder, ObjectProperty};
pub use mirror::ObjectMirror;

/// Maximum declared properties per object
pub const MAX_PROPERTIES: usize = 100;

/// A changed property, from its value at execution start to its latest value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMutation {
    pub object: String,
    pub property: String,
    pub before: Value,
    pub after: Value,
}

impl ObjectMutation {
    /// Identity of the mutated slot, `object:property`
    pub fn key(&self) -> String {
        format!("{}:{}", self.object, self.property)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObjectError {
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Object {object} declares {member} more than once")]
    DuplicateMember { object: String, member: String },

    #[error("Object {object} has {count} properties (max {max})", max = MAX_PROPERTIES)]
    TooManyProperties { object: String, count: usize },

    #[error("Cannot add property {property} to sealed object {object}")]
    UnknownProperty { object: String, property: String },

    #[error("Property {object}.{property} is not writable")]
    ReadOnly { object: String, property: String },

    #[error("Invalid value for {object}.{property}: {source}")]
    SchemaViolation {
        object: String,
        property: String,
        source: SchemaError,
    },
}
