//! # Stepwise Core
//!
//! Core types, configuration, and checkpoint storage for Stepwise.
//!
//! This crate provides:
//! - Configuration loading and validation (JSON5 format)
//! - Agent restriction, retry, and stop-condition settings
//! - Durable checkpoint records with sled and in-memory stores
//! - Tool parameter validation against JSON Schema

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod types;
pub mod validation;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, MemoryCheckpointStore, SledCheckpointStore,
};
pub use config::{
    AgentConfig, ApprovalPolicy, Config, ConfigError, RestrictionConfig, RetryOptions,
    StopCondition,
};
pub use types::{RunId, SuspensionKey, TokenUsage, ToolCallId};
pub use validation::{ValidationError, validate_tool_params};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, CheckpointStore};
    pub use crate::config::{Config, RestrictionConfig, RetryOptions, StopCondition};
    pub use crate::types::*;
}
