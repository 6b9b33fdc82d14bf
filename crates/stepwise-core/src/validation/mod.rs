//! Tool parameter validation.
//!
//! Arguments produced by a model are untrusted: bound their size and
//! nesting before checking them against the tool's JSON Schema.

use serde_json::Value;
use thiserror::Error;

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Input exceeds maximum allowed length.
    #[error("Input exceeds maximum length ({max} bytes, got {actual})")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual input length.
        actual: usize,
    },

    /// JSON nesting is deeper than allowed.
    #[error("JSON nesting depth exceeds maximum ({max})")]
    TooDeep {
        /// Maximum allowed depth.
        max: usize,
    },

    /// The schema itself could not be compiled.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// Input failed schema validation.
    #[error("Input failed schema validation: {}", format_issues(.0))]
    SchemaViolation(Vec<(String, String)>),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

fn format_issues(issues: &[(String, String)]) -> String {
    issues
        .iter()
        .map(|(path, message)| {
            if path.is_empty() {
                message.clone()
            } else {
                format!("{path}: {message}")
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Size limits per input type.
pub mod limits {
    /// Maximum tool parameters size (1MB).
    pub const MAX_TOOL_PARAMS_SIZE: usize = 1024 * 1024;

    /// Maximum JSON nesting depth.
    pub const MAX_JSON_DEPTH: usize = 32;
}

/// Validate tool parameters against a JSON schema.
///
/// # Errors
///
/// Returns `TooLong`/`TooDeep` for oversized input, `InvalidSchema` if the
/// schema does not compile, and `SchemaViolation` with instance paths when
/// the parameters do not conform.
pub fn validate_tool_params(params: &Value, schema: &Value) -> Result<(), ValidationError> {
    let size = serde_json::to_string(params)?.len();
    if size > limits::MAX_TOOL_PARAMS_SIZE {
        return Err(ValidationError::TooLong {
            max: limits::MAX_TOOL_PARAMS_SIZE,
            actual: size,
        });
    }

    check_json_depth(params, 0, limits::MAX_JSON_DEPTH)?;

    let issues = schema_issues(params, schema)?;
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::SchemaViolation(issues))
    }
}

/// Collect `(instance path, message)` pairs for every schema violation.
///
/// # Errors
///
/// Returns `InvalidSchema` if the schema cannot be compiled.
pub fn schema_issues(
    instance: &Value,
    schema: &Value,
) -> Result<Vec<(String, String)>, ValidationError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| ValidationError::InvalidSchema(e.to_string()))?;

    Ok(validator
        .iter_errors(instance)
        .map(|err| (err.instance_path.to_string(), err.to_string()))
        .collect())
}

/// Check JSON nesting depth to prevent stack overflow.
fn check_json_depth(value: &Value, depth: usize, max: usize) -> Result<(), ValidationError> {
    if depth > max {
        return Err(ValidationError::TooDeep { max });
    }

    match value {
        Value::Array(arr) => {
            for item in arr {
                check_json_depth(item, depth + 1, max)?;
            }
        }
        Value::Object(obj) => {
            for item in obj.values() {
                check_json_depth(item, depth + 1, max)?;
            }
        }
        _ => {}
    }

    Ok(())
}
