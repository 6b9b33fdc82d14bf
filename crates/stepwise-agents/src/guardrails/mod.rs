//! Guardrail pipeline.
//!
//! Guardrails run in registration order on every model response, before
//! any tool executes. Each one may pass the turn through, rewrite its
//! content or tool calls for everything downstream, or fail the run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stepwise_core::types::{RunId, TokenUsage};

use crate::tools::ToolCall;

/// A model response as seen by guardrails and tool execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTurn {
    /// Text content.
    pub content: String,
    /// Requested tool calls, in order.
    pub tool_calls: Vec<ToolCall>,
}

/// Read-only view of the run for guardrails.
#[derive(Debug, Clone, Copy)]
pub struct GuardrailContext<'a> {
    /// Run being checked.
    pub run_id: &'a RunId,
    /// Index of the step that produced the turn.
    pub step_index: u64,
    /// Usage so far, including this turn.
    pub usage: &'a TokenUsage,
}

/// What a guardrail decided.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailResult {
    /// Pass the turn through unchanged.
    Continue,
    /// Replace content and/or tool calls.
    ContinueWith {
        /// New content, if changed.
        content: Option<String>,
        /// New tool calls, if changed.
        tool_calls: Option<Vec<ToolCall>>,
    },
    /// Stop the run.
    Fail {
        /// Why.
        reason: String,
    },
}

/// Terminal error from a failing guardrail.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Guardrail '{guardrail}' failed: {reason}")]
pub struct GuardrailFailure {
    /// Name of the guardrail that failed.
    pub guardrail: String,
    /// Reason it gave.
    pub reason: String,
}

/// A check over one model turn. Must not have side effects.
pub trait Guardrail: Send + Sync {
    /// Name used in failures and logs.
    fn name(&self) -> &str;

    /// Check a turn.
    fn check(&self, ctx: &GuardrailContext<'_>, turn: &ModelTurn) -> GuardrailResult;
}

/// Ordered list of guardrails.
#[derive(Clone, Default)]
pub struct GuardrailPipeline {
    guardrails: Vec<Arc<dyn Guardrail>>,
}

impl GuardrailPipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a guardrail.
    #[must_use]
    pub fn with(mut self, guardrail: impl Guardrail + 'static) -> Self {
        self.guardrails.push(Arc::new(guardrail));
        self
    }

    /// Append a shared guardrail.
    pub fn push(&mut self, guardrail: Arc<dyn Guardrail>) {
        self.guardrails.push(guardrail);
    }

    /// Number of guardrails.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guardrails.len()
    }

    /// Whether the pipeline is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }

    /// Run every guardrail in order.
    ///
    /// # Errors
    ///
    /// Returns the first failure; later guardrails are not consulted.
    pub fn run(
        &self,
        ctx: &GuardrailContext<'_>,
        mut turn: ModelTurn,
    ) -> Result<ModelTurn, GuardrailFailure> {
        for guardrail in &self.guardrails {
            match guardrail.check(ctx, &turn) {
                GuardrailResult::Continue => {}
                GuardrailResult::ContinueWith {
                    content,
                    tool_calls,
                } => {
                    tracing::debug!(guardrail = guardrail.name(), "Guardrail rewrote turn");
                    if let Some(content) = content {
                        turn.content = content;
                    }
                    if let Some(tool_calls) = tool_calls {
                        turn.tool_calls = tool_calls;
                    }
                }
                GuardrailResult::Fail { reason } => {
                    tracing::warn!(guardrail = guardrail.name(), %reason, "Guardrail failed");
                    return Err(GuardrailFailure {
                        guardrail: guardrail.name().to_string(),
                        reason,
                    });
                }
            }
        }
        Ok(turn)
    }
}

/// Fails when the model calls any listed tool.
#[derive(Debug, Clone)]
pub struct BlockedTools {
    names: Vec<String>,
}

impl BlockedTools {
    /// Block these tool names.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl Guardrail for BlockedTools {
    fn name(&self) -> &str {
        "blocked_tools"
    }

    fn check(&self, _ctx: &GuardrailContext<'_>, turn: &ModelTurn) -> GuardrailResult {
        turn.tool_calls
            .iter()
            .find(|call| self.names.contains(&call.name))
            .map_or(GuardrailResult::Continue, |call| GuardrailResult::Fail {
                reason: format!("tool '{}' is blocked", call.name),
            })
    }
}

/// Keeps at most `max` tool calls per turn, dropping the rest.
#[derive(Debug, Clone, Copy)]
pub struct MaxToolCalls {
    max: usize,
}

impl MaxToolCalls {
    /// Allow up to `max` calls per turn.
    #[must_use]
    pub const fn new(max: usize) -> Self {
        Self { max }
    }
}

impl Guardrail for MaxToolCalls {
    fn name(&self) -> &str {
        "max_tool_calls"
    }

    fn check(&self, _ctx: &GuardrailContext<'_>, turn: &ModelTurn) -> GuardrailResult {
        if turn.tool_calls.len() <= self.max {
            return GuardrailResult::Continue;
        }
        GuardrailResult::ContinueWith {
            content: None,
            tool_calls: Some(turn.tool_calls[..self.max].to_vec()),
        }
    }
}

type CheckFn = dyn Fn(&GuardrailContext<'_>, &ModelTurn) -> GuardrailResult + Send + Sync;

/// Guardrail from a closure.
pub struct FnGuardrail {
    name: String,
    check: Box<CheckFn>,
}

impl FnGuardrail {
    /// Wrap `check` under `name`.
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&GuardrailContext<'_>, &ModelTurn) -> GuardrailResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }
}

impl Guardrail for FnGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, ctx: &GuardrailContext<'_>, turn: &ModelTurn) -> GuardrailResult {
        (self.check)(ctx, turn)
    }
}
