//! Core types used throughout Stepwise.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a workflow or agent run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Create a new run ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a run ID from the current time and a caller-supplied label.
    ///
    /// Format: `<label>-<unix millis>`
    #[must_use]
    pub fn generate(label: &str) -> Self {
        Self(format!("{label}-{}", chrono::Utc::now().timestamp_millis()))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one tool call within a model turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallId(pub String);

impl ToolCallId {
    /// Create a new tool call ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ToolCallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ToolCallId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Key pairing a suspension request with its single resume response.
///
/// Keys are deterministic so that a replayed step asks for the same key.
/// Tool keys carry the step index: providers reuse call ids across turns,
/// and a resolved key must never answer a later, different call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SuspensionKey(pub String);

impl SuspensionKey {
    /// Create a new suspension key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key used when a tool call in step `step_index` needs approval.
    #[must_use]
    pub fn approval(step_index: u64, call_id: &ToolCallId) -> Self {
        Self(format!("approval:{step_index}:{}", call_id.0))
    }

    /// Key used when a tool call in step `step_index` asks the user for input.
    #[must_use]
    pub fn user_input(step_index: u64, call_id: &ToolCallId) -> Self {
        Self(format!("input:{step_index}:{}", call_id.0))
    }
}

impl fmt::Display for SuspensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SuspensionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SuspensionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Token usage statistics from an LLM call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input/prompt tokens.
    pub input_tokens: u64,
    /// Output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Create usage from input and output counts.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Get total tokens used.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Add another usage record to this one.
    pub fn accumulate(&mut self, other: &Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}
