//! Guarded tool execution.
//!
//! Every call passes through here: lookup, argument validation, the
//! security gate, and, when the gate asks for it, an approval suspension.
//! Failures become error results for the model; nothing here aborts a run.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};

use stepwise_core::config::RestrictionConfig;
use stepwise_core::types::SuspensionKey;

use super::{ToolCall, ToolContext, ToolError, ToolOutput, ToolRegistry, ToolResult};
use crate::environment::ExecutionEnvironment;
use crate::security::{GateDecision, SecurityError, ToolAccess, classify, resolve_against};
use crate::suspension::{ApprovalDecision, SuspendPoll, SuspensionLedger};

/// Executes tool calls under a restriction.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    env: Arc<dyn ExecutionEnvironment>,
    restriction: Arc<RestrictionConfig>,
    root: PathBuf,
}

impl ToolExecutor {
    /// Create an executor.
    ///
    /// `root` is the absolute restriction root, usually from
    /// [`crate::security::restriction_root`].
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        env: Arc<dyn ExecutionEnvironment>,
        restriction: Arc<RestrictionConfig>,
        root: PathBuf,
    ) -> Self {
        Self {
            registry,
            env,
            restriction,
            root,
        }
    }

    /// Tools available to this executor.
    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Active restriction.
    #[must_use]
    pub fn restriction(&self) -> &RestrictionConfig {
        &self.restriction
    }

    /// Execute one call made in step `step_index`.
    ///
    /// Returns `ToolOutput::Suspended` when the call waits on approval or
    /// user input; calling again in the same step after the suspension is
    /// resolved picks up the stored answer without prompting again.
    pub async fn execute(
        &self,
        call: &ToolCall,
        step_index: u64,
        suspensions: &mut SuspensionLedger,
    ) -> ToolOutput {
        match self.try_execute(call, step_index, suspensions).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
                ToolOutput::Result(e.into())
            }
        }
    }

    async fn try_execute(
        &self,
        call: &ToolCall,
        step_index: u64,
        suspensions: &mut SuspensionLedger,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self.registry.prepare(call)?;
        let access = tool.access(&call.arguments);

        let resolved_path = match classify(&access, &self.restriction, &self.root) {
            GateDecision::Allowed { resolved } => resolved,
            GateDecision::Denied(violation) => {
                tracing::warn!(tool = %call.name, %violation, "Tool call denied");
                return Err(violation.into());
            }
            GateDecision::NeedsApproval(violation) => {
                let key = SuspensionKey::approval(step_index, &call.id);
                let payload = self.approval_payload(&call.name, &access, &violation);

                match suspensions.suspend(key, payload)? {
                    SuspendPoll::Pending(request) => {
                        tracing::info!(tool = %call.name, %violation, "Tool call awaits approval");
                        return Ok(ToolOutput::Suspended(request));
                    }
                    SuspendPoll::Ready(answer) => {
                        let decision = ApprovalDecision::from_answer(&answer);
                        if !decision.approved {
                            return Err(ToolError::PermissionDenied(decision.reason.unwrap_or_else(
                                || format!("{} was not approved", violation_target(&violation)),
                            )));
                        }
                        tracing::info!(tool = %call.name, "Tool call approved");
                        match &access {
                            ToolAccess::Path(path) => Some(resolve_against(path, &self.root)),
                            _ => None,
                        }
                    }
                }
            }
        };

        let mut ctx = ToolContext {
            call_id: &call.id,
            step_index,
            env: self.env.as_ref(),
            root: &self.root,
            resolved_path,
            suspensions,
        };

        tracing::debug!(tool = %call.name, call_id = %call.id, "Executing tool");
        tool.execute(call.arguments.clone(), &mut ctx).await
    }

    fn approval_payload(&self, tool_name: &str, access: &ToolAccess, violation: &SecurityError) -> Value {
        let mut payload = json!({
            "toolName": tool_name,
            "restriction": {
                "baseDirectory": self.root.display().to_string(),
                "commandAllowlist": self.restriction.command_allowlist,
            },
            "reason": violation.to_string(),
        });

        match access {
            ToolAccess::Path(path) => {
                payload["path"] = json!(resolve_against(path, &self.root).display().to_string());
            }
            ToolAccess::Command(command) => payload["command"] = json!(command.trim()),
            ToolAccess::Unrestricted => {}
        }
        payload
    }
}

fn violation_target(violation: &SecurityError) -> String {
    match violation {
        SecurityError::PathTraversal { path, .. } => format!("Access to '{path}'"),
        SecurityError::CommandNotAllowed { command } => format!("Command '{command}'"),
    }
}
