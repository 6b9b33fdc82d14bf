//! Workflow state lifecycle.
//!
//! State is a JSON object checked against a JSON Schema. It is created
//! from schema defaults, merged field by field as steps run, and bounded
//! to 1 MiB when serialized for a checkpoint. Oversized state is rejected,
//! never truncated.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Largest serialized state that may be checkpointed.
pub const MAX_STATE_BYTES: usize = 1_048_576;

/// One schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIssue {
    /// JSON pointer to the offending field; empty for the root.
    pub path: String,
    /// What is wrong.
    pub message: String,
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// State errors.
#[derive(Error, Debug)]
pub enum StateError {
    /// State does not satisfy its schema.
    #[error("State failed schema validation: {}", join_issues(issues))]
    Schema {
        /// Every violation found.
        issues: Vec<SchemaIssue>,
    },

    /// Schema could not be compiled.
    #[error("Invalid state schema: {0}")]
    InvalidSchema(String),

    /// Serialized state exceeds the size bound.
    #[error("State is {size} bytes, limit is {limit}")]
    SizeLimit {
        /// Serialized size.
        size: usize,
        /// Allowed size.
        limit: usize,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn join_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A compiled state schema.
#[derive(Clone)]
pub struct StateSchema {
    raw: Value,
    validator: Arc<jsonschema::Validator>,
}

impl StateSchema {
    /// Compile a JSON Schema.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidSchema` if the schema does not compile.
    pub fn new(schema: Value) -> Result<Self, StateError> {
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| StateError::InvalidSchema(e.to_string()))?;
        Ok(Self {
            raw: schema,
            validator: Arc::new(validator),
        })
    }

    /// Schema that accepts any object.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the schema is fixed.
    pub fn any_object() -> Result<Self, StateError> {
        Self::new(serde_json::json!({ "type": "object" }))
    }

    /// The schema document.
    #[must_use]
    pub const fn raw(&self) -> &Value {
        &self.raw
    }

    /// Every violation of `value` against this schema.
    #[must_use]
    pub fn issues(&self, value: &Value) -> Vec<SchemaIssue> {
        let mut issues: Vec<SchemaIssue> = self
            .validator
            .iter_errors(value)
            .map(|e| SchemaIssue {
                path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect();

        if issues.is_empty() && !value.is_object() {
            issues.push(SchemaIssue {
                path: String::new(),
                message: "workflow state must be a JSON object".to_string(),
            });
        }
        issues
    }

    /// Value built from the schema's `default` keywords.
    ///
    /// Object properties are filled recursively. A nested object is only
    /// created when something inside it has a default.
    #[must_use]
    pub fn defaults(&self) -> Value {
        defaults_for(&self.raw).unwrap_or_else(|| Value::Object(Map::new()))
    }
}

impl fmt::Debug for StateSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSchema").field("raw", &self.raw).finish()
    }
}

fn defaults_for(schema: &Value) -> Option<Value> {
    if let Some(default) = schema.get("default") {
        return Some(default.clone());
    }

    let properties = schema.get("properties")?.as_object()?;
    let mut object = Map::new();
    for (name, property) in properties {
        if let Some(value) = defaults_for(property) {
            object.insert(name.clone(), value);
        }
    }

    Some(Value::Object(object))
}

/// Workflow state: a JSON object that satisfied its schema when created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowState(Map<String, Value>);

impl WorkflowState {
    /// Field value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set a field in place. Not validated until the next checkpoint.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Fields as a JSON map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// State as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Deserialize into a typed view.
    ///
    /// # Errors
    ///
    /// Returns error if the fields do not fit `T`.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        Ok(serde_json::from_value(self.to_value())?)
    }

    /// Capture any serializable object as state, without a schema.
    ///
    /// # Errors
    ///
    /// Returns error if `value` does not serialize to a JSON object.
    pub fn capture<T: Serialize>(value: &T) -> Result<Self, StateError> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(StateError::Schema {
                issues: vec![SchemaIssue {
                    path: String::new(),
                    message: "workflow state must be a JSON object".to_string(),
                }],
            }),
        }
    }

    /// Build state from a typed value, validating it.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Schema` if the value violates the schema.
    pub fn from_typed<T: Serialize>(value: &T, schema: &StateSchema) -> Result<Self, StateError> {
        validate(serde_json::to_value(value)?, schema)
    }
}

/// Create initial state from schema defaults.
///
/// # Errors
///
/// Returns `StateError::Schema` if the defaults do not form a valid state.
pub fn initialize(schema: &StateSchema) -> Result<WorkflowState, StateError> {
    validate(schema.defaults(), schema)
}

/// Check a value against the schema without coercion.
///
/// # Errors
///
/// Returns `StateError::Schema` with every violation.
pub fn validate(value: Value, schema: &StateSchema) -> Result<WorkflowState, StateError> {
    let issues = schema.issues(&value);
    match value {
        Value::Object(map) if issues.is_empty() => Ok(WorkflowState(map)),
        _ => Err(StateError::Schema { issues }),
    }
}

/// Encode state for persistence.
///
/// # Errors
///
/// Returns `StateError::SizeLimit` above [`MAX_STATE_BYTES`].
pub fn serialize(state: &WorkflowState) -> Result<Vec<u8>, StateError> {
    let bytes = serde_json::to_vec(state)?;
    if bytes.len() > MAX_STATE_BYTES {
        return Err(StateError::SizeLimit {
            size: bytes.len(),
            limit: MAX_STATE_BYTES,
        });
    }
    Ok(bytes)
}

/// Decode state, validating it when a schema is given.
///
/// # Errors
///
/// Returns error on malformed bytes or schema violations.
pub fn deserialize(bytes: &[u8], schema: Option<&StateSchema>) -> Result<WorkflowState, StateError> {
    let value: Value = serde_json::from_slice(bytes)?;
    match schema {
        Some(schema) => validate(value, schema),
        None => WorkflowState::capture(&value),
    }
}

/// Overwrite top-level fields of `current` with those in `updates`.
///
/// Fields absent from `updates` are kept. Nested objects are replaced
/// whole. `null` is a value and overwrites.
#[must_use]
pub fn merge(current: &WorkflowState, updates: &Map<String, Value>) -> WorkflowState {
    let mut merged = current.0.clone();
    for (key, value) in updates {
        merged.insert(key.clone(), value.clone());
    }
    WorkflowState(merged)
}

/// Copy state through a serialize/deserialize round trip.
///
/// # Errors
///
/// Returns `StateError::SizeLimit` if the state could not be persisted.
pub fn clone_state(state: &WorkflowState) -> Result<WorkflowState, StateError> {
    deserialize(&serialize(state)?, None)
}
