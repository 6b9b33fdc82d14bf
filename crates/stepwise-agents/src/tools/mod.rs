//! Tool registry and execution.

pub mod builtin;
pub mod guard;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use stepwise_core::types::ToolCallId;
use stepwise_core::validation::validate_tool_params;
use stepwise_providers::traits::Tool as ToolDefinition;

use crate::environment::{EnvironmentError, ExecutionEnvironment};
use crate::security::{SecurityError, ToolAccess};
use crate::suspension::{SuspensionError, SuspensionLedger, SuspensionRequest};

pub use builtin::{AskUserTool, ExecTool, GetCwdTool, GlobTool, ReadFileTool, register_builtin_tools};
pub use guard::ToolExecutor;

/// Tool execution errors.
#[derive(Error, Debug)]
pub enum ToolError {
    /// Tool not found.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Invalid parameters.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// A human declined the call.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The security gate refused the call.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Suspension protocol misuse.
    #[error(transparent)]
    Suspension(#[from] SuspensionError),

    /// Environment failure.
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

/// One tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call identifier, unique within the run.
    pub id: ToolCallId,
    /// Tool name.
    pub name: String,
    /// Arguments as produced by the model.
    pub arguments: Value,
}

impl ToolCall {
    /// Create a tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: ToolCallId::new(id),
            name: name.into(),
            arguments,
        }
    }
}

/// Tool execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether execution succeeded.
    pub success: bool,
    /// Result content.
    pub content: String,
    /// Error message if failed.
    pub error: Option<String>,
}

impl ToolResult {
    /// Create a successful result.
    #[must_use]
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: None,
        }
    }

    /// Create an error result.
    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            error: Some(error.into()),
        }
    }

    /// Text fed back to the model.
    #[must_use]
    pub fn model_content(&self) -> String {
        match (&self.error, self.success) {
            (Some(error), false) => error.clone(),
            _ => self.content.clone(),
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(error: ToolError) -> Self {
        Self::error(error.to_string())
    }
}

/// What a tool call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// Finished, successfully or not.
    Result(ToolResult),
    /// Waiting for external input.
    Suspended(SuspensionRequest),
}

/// Everything a tool may use while executing one call.
pub struct ToolContext<'a> {
    /// Call being executed.
    pub call_id: &'a ToolCallId,
    /// Step of the run the call belongs to.
    pub step_index: u64,
    /// Environment that performs filesystem and process work.
    pub env: &'a dyn ExecutionEnvironment,
    /// Restriction root.
    pub root: &'a Path,
    /// Path approved by the security gate, for path-based tools.
    pub resolved_path: Option<PathBuf>,
    /// Suspensions of the current run.
    pub suspensions: &'a mut SuspensionLedger,
}

/// Tool trait for implementing custom tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name.
    fn name(&self) -> &str;

    /// Tool description.
    fn description(&self) -> &str;

    /// Input schema (JSON Schema).
    fn input_schema(&self) -> Value;

    /// Filesystem or shell access this call needs.
    ///
    /// Called with already validated parameters, before `execute`.
    fn access(&self, _params: &Value) -> ToolAccess {
        ToolAccess::Unrestricted
    }

    /// Execute the tool.
    async fn execute(
        &self,
        params: Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError>;
}

/// Handle returned by [`ToolRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolHandle {
    name: String,
}

impl ToolHandle {
    /// Name the tool is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ToolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Registry of available tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> ToolHandle {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Replacing registered tool");
        }
        ToolHandle { name }
    }

    /// Get a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Get a tool by handle.
    #[must_use]
    pub fn resolve(&self, handle: &ToolHandle) -> Option<&Arc<dyn Tool>> {
        self.tools.get(&handle.name)
    }

    /// List all tool names.
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Registry restricted to `names`. An empty list keeps every tool.
    #[must_use]
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Self {
        if names.is_empty() {
            return self.clone();
        }
        let tools = self
            .tools
            .iter()
            .filter(|(name, _)| names.iter().any(|n| n.as_ref() == name.as_str()))
            .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
            .collect();
        Self { tools }
    }

    /// Look up a tool and validate arguments against its schema.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown tools and `InvalidParams` for
    /// arguments that are oversized, too deep, or violate the schema.
    pub fn prepare(&self, call: &ToolCall) -> Result<&Arc<dyn Tool>, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        validate_tool_params(&call.arguments, &tool.input_schema())
            .map_err(|e| ToolError::InvalidParams(e.to_string()))?;

        Ok(tool)
    }

    /// Get tool definitions for provider API.
    #[must_use]
    pub fn as_tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_registry() {
        let mut registry = ToolRegistry::new();
        let handle = registry.register(Arc::new(GetCwdTool));

        assert_eq!(handle.name(), "get_cwd");
        assert!(registry.resolve(&handle).is_some());
        assert!(registry.get("get_cwd").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn test_tool_definitions() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);

        let defs = registry.as_tool_definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["ask_user", "exec", "get_cwd", "glob", "read_file"]);
    }

    #[test]
    fn test_subset() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);

        assert_eq!(registry.subset(&["exec", "missing"]).list(), vec!["exec"]);
        assert_eq!(registry.subset::<&str>(&[]).list().len(), 5);
    }

    #[test]
    fn test_prepare_validates_arguments() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);

        let ok = ToolCall::new("c1", "exec", json!({"command": "ls"}));
        assert!(registry.prepare(&ok).is_ok());

        let missing = ToolCall::new("c2", "exec", json!({}));
        assert!(matches!(
            registry.prepare(&missing),
            Err(ToolError::InvalidParams(_))
        ));

        let unknown = ToolCall::new("c3", "nope", json!({}));
        assert!(matches!(
            registry.prepare(&unknown),
            Err(ToolError::NotFound(_))
        ));
    }

    #[test]
    fn test_result_content() {
        assert_eq!(ToolResult::success("ok").model_content(), "ok");
        assert_eq!(ToolResult::error("bad").model_content(), "bad");
        let from_err: ToolResult = ToolError::PermissionDenied("nope".into()).into();
        assert!(!from_err.success);
        assert_eq!(from_err.model_content(), "Permission denied: nope");
    }
}
