//! Provider traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stepwise_core::types::TokenUsage;

/// Provider errors.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// API error.
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Network error.
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rate limited.
    #[error("Rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retry.
        retry_after_secs: u64,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether a retry may succeed.
    ///
    /// Rate limits, network failures, request timeouts (408), 429 and
    /// server errors (5xx) are transient. Everything else is not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) => true,
            Self::Api { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            Self::Serialization(_) | Self::Config(_) => false,
        }
    }
}

/// Completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model to use.
    pub model: String,

    /// Messages in conversation.
    pub messages: Vec<Message>,

    /// System prompt.
    pub system: Option<String>,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Temperature for sampling.
    pub temperature: f32,

    /// Stop sequences.
    pub stop: Option<Vec<String>>,

    /// Tools available.
    pub tools: Option<Vec<Tool>>,
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message role.
    pub role: Role,

    /// Message content.
    pub content: MessageContent,
}

impl Message {
    /// A plain-text user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// An assistant message made of content blocks.
    #[must_use]
    pub const fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// A user message carrying tool results.
    #[must_use]
    pub const fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message.
    User,
    /// Assistant message.
    Assistant,
    /// System message.
    System,
}

/// Message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple text content.
    Text(String),
    /// Structured content blocks.
    Blocks(Vec<ContentBlock>),
}

/// Content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text block.
    Text {
        /// Text content.
        text: String,
    },
    /// Tool use block.
    ToolUse {
        /// Tool ID.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input.
        input: serde_json::Value,
    },
    /// Tool result block.
    ToolResult {
        /// Tool use ID.
        tool_use_id: String,
        /// Tool result content.
        content: String,
        /// Whether tool errored.
        is_error: Option<bool>,
    },
}

/// Tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// Input schema.
    pub input_schema: serde_json::Value,
}

/// Completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Response ID.
    pub id: String,

    /// Model used.
    pub model: String,

    /// Response content.
    pub content: Vec<ContentBlock>,

    /// Stop reason.
    pub stop_reason: Option<StopReason>,

    /// Token usage.
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// Build a response from content blocks.
    ///
    /// The stop reason is `ToolUse` when any block requests a tool.
    #[must_use]
    pub fn from_blocks(content: Vec<ContentBlock>) -> Self {
        let stop_reason = if content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
        {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };

        Self {
            id: String::new(),
            model: String::new(),
            content,
            stop_reason: Some(stop_reason),
            usage: TokenUsage::default(),
        }
    }

    /// A text-only response.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::from_blocks(vec![ContentBlock::Text { text: text.into() }])
    }

    /// Set token usage.
    #[must_use]
    pub const fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Concatenated text of all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Reason the generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// End of turn.
    EndTurn,
    /// Hit max tokens.
    MaxTokens,
    /// Hit stop sequence.
    StopSequence,
    /// Tool use requested.
    ToolUse,
}

/// AI provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Create a completion.
    async fn complete(&self, request: CompletionRequest)
    -> Result<CompletionResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        for status in [408, 429, 500, 503, 599] {
            let err = ProviderError::Api {
                status,
                message: String::new(),
            };
            assert!(err.is_transient(), "{status} should be transient");
        }
        for status in [400, 401, 403, 404, 422] {
            let err = ProviderError::Api {
                status,
                message: String::new(),
            };
            assert!(!err.is_transient(), "{status} should not be transient");
        }
        assert!(!ProviderError::Config("missing key".into()).is_transient());
    }

    #[test]
    fn test_response_stop_reason() {
        let text = CompletionResponse::from_text("done");
        assert_eq!(text.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(text.text(), "done");

        let tool = CompletionResponse::from_blocks(vec![ContentBlock::ToolUse {
            id: "call_1".into(),
            name: "get_cwd".into(),
            input: json!({}),
        }]);
        assert_eq!(tool.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(tool.text(), "");
    }

    #[test]
    fn test_content_block_wire_format() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "call_1".into(),
            content: "ok".into(),
            is_error: Some(false),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["tool_use_id"], "call_1");
    }
}
