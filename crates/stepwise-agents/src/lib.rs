//! # Stepwise Agents
//!
//! Execution core for agent workflows.
//!
//! - [`runtime`]: the step executor driving model calls, guardrails,
//!   guarded tool execution, stop conditions, and checkpoints
//! - [`security`]: glob matching, path containment, command allowlists
//! - [`suspension`]: durable suspend/resume for approvals and user input
//! - [`state`]: schema-validated, size-bounded workflow state
//! - [`workflow`]: user-defined steps over a shared state

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod environment;
pub mod error;
pub mod guardrails;
pub mod retry;
pub mod runtime;
pub mod security;
pub mod state;
pub mod suspension;
pub mod tools;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use environment::{ExecutionEnvironment, LocalEnvironment};
pub use error::{Error, Result};
pub use guardrails::{Guardrail, GuardrailPipeline, GuardrailResult, ModelTurn};
pub use retry::RetryPolicy;
pub use runtime::{AgentRuntime, RunOutcome, RunState, StepInvocation, resume_run};
pub use security::{GateDecision, ToolAccess, assert_safe_path, evaluate_allowlist};
pub use state::{StateSchema, WorkflowState};
pub use suspension::{SuspensionLedger, SuspensionRecord, SuspensionRequest};
pub use tools::{Tool, ToolCall, ToolExecutor, ToolRegistry, ToolResult};
pub use workflow::{StepContext, Workflow, WorkflowEngine, WorkflowRegistry, WorkflowStep};
