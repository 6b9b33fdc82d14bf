//! Built-in tools.
//!
//! Filesystem and shell tools declare their access so the executor can run
//! them through the security gate. `ask_user` suspends the run directly.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use stepwise_core::types::SuspensionKey;

use super::{Tool, ToolContext, ToolError, ToolHandle, ToolOutput, ToolRegistry, ToolResult};
use crate::security::ToolAccess;
use crate::suspension::SuspendPoll;

/// Register every built-in tool.
pub fn register_builtin_tools(registry: &mut ToolRegistry) -> Vec<ToolHandle> {
    vec![
        registry.register(Arc::new(ReadFileTool)),
        registry.register(Arc::new(GlobTool)),
        registry.register(Arc::new(ExecTool)),
        registry.register(Arc::new(GetCwdTool)),
        registry.register(Arc::new(AskUserTool)),
    ]
}

fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::InvalidParams(e.to_string()))
}

fn target_path(ctx: &ToolContext<'_>, requested: &str) -> PathBuf {
    ctx.resolved_path
        .clone()
        .unwrap_or_else(|| ctx.root.join(requested))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileParams {
    path: String,
    #[serde(default)]
    max_bytes: Option<usize>,
}

/// Read a UTF-8 file under the restriction root.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, relative to the workspace" },
                "maxBytes": { "type": "integer", "minimum": 1 }
            },
            "required": ["path"]
        })
    }

    fn access(&self, params: &Value) -> ToolAccess {
        ToolAccess::Path(PathBuf::from(params["path"].as_str().unwrap_or_default()))
    }

    async fn execute(
        &self,
        params: Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let params: ReadFileParams = parse(params)?;
        let path = target_path(ctx, &params.path);

        let mut content = ctx.env.read_file(&path).await?;
        if let Some(max) = params.max_bytes {
            if content.len() > max {
                let mut cut = max;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }
        }

        Ok(ToolOutput::Result(ToolResult::success(content)))
    }
}

#[derive(Deserialize)]
struct GlobParams {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

/// Find files by pattern.
pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "List files whose path matches a pattern; '*' matches any characters"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" },
                "path": { "type": "string", "description": "Directory to search, default '.'" }
            },
            "required": ["pattern"]
        })
    }

    fn access(&self, params: &Value) -> ToolAccess {
        ToolAccess::Path(PathBuf::from(params["path"].as_str().unwrap_or(".")))
    }

    async fn execute(
        &self,
        params: Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let params: GlobParams = parse(params)?;
        let base = target_path(ctx, params.path.as_deref().unwrap_or("."));

        let found = ctx.env.glob(&params.pattern, &base).await?;
        let listing = found
            .iter()
            .map(|p| p.strip_prefix(&base).unwrap_or(p).display().to_string())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutput::Result(ToolResult::success(listing)))
    }
}

#[derive(Deserialize)]
struct ExecParams {
    command: String,
}

/// Run a shell command at the restriction root.
pub struct ExecTool;

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                }
            },
            "required": ["command"]
        })
    }

    fn access(&self, params: &Value) -> ToolAccess {
        ToolAccess::Command(params["command"].as_str().unwrap_or_default().to_string())
    }

    async fn execute(
        &self,
        params: Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let params: ExecParams = parse(params)?;
        let output = ctx.env.exec(&params.command, ctx.root).await?;

        if output.success() {
            Ok(ToolOutput::Result(ToolResult::success(output.stdout)))
        } else {
            let error_msg = if output.stderr.is_empty() {
                format!("Command failed with exit code {}", output.exit_code)
            } else {
                output.stderr
            };
            Ok(ToolOutput::Result(ToolResult::error(error_msg)))
        }
    }
}

/// Report the environment's working directory.
pub struct GetCwdTool;

#[async_trait]
impl Tool for GetCwdTool {
    fn name(&self) -> &str {
        "get_cwd"
    }

    fn description(&self) -> &str {
        "Get the current working directory"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(
        &self,
        _params: Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let cwd = ctx.env.get_cwd().await?;
        Ok(ToolOutput::Result(ToolResult::success(cwd.display().to_string())))
    }
}

#[derive(Deserialize)]
struct AskUserParams {
    question: String,
    #[serde(default)]
    options: Option<Vec<String>>,
}

/// Ask a human a question and wait for the answer.
pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question; the run pauses until they answer"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string" },
                "options": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["question"]
        })
    }

    async fn execute(
        &self,
        params: Value,
        ctx: &mut ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let params: AskUserParams = parse(params)?;
        let key = SuspensionKey::user_input(ctx.step_index, ctx.call_id);
        let prompt = json!({
            "question": params.question,
            "options": params.options,
        });

        match ctx.suspensions.suspend(key, prompt)? {
            SuspendPoll::Ready(Value::String(answer)) => {
                Ok(ToolOutput::Result(ToolResult::success(answer)))
            }
            SuspendPoll::Ready(answer) => {
                Ok(ToolOutput::Result(ToolResult::success(answer.to_string())))
            }
            SuspendPoll::Pending(request) => Ok(ToolOutput::Suspended(request)),
        }
    }
}
