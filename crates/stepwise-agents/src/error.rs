//! Error types re-exported in one place.

use thiserror::Error;

pub use crate::environment::EnvironmentError;
pub use crate::guardrails::GuardrailFailure;
pub use crate::runtime::AgentRuntimeError;
pub use crate::security::SecurityError;
pub use crate::state::{SchemaIssue, StateError};
pub use crate::suspension::SuspensionError;
pub use crate::tools::ToolError;
pub use crate::workflow::{StepError, WorkflowError};

/// Any error surfaced by this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Agent loop failure.
    #[error(transparent)]
    Agent(#[from] AgentRuntimeError),

    /// Workflow failure.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// State store failure.
    #[error(transparent)]
    State(#[from] StateError),

    /// Suspension protocol misuse.
    #[error(transparent)]
    Suspension(#[from] SuspensionError),

    /// Security gate refusal.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Tool failure.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Result alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
