//! # Stepwise Providers
//!
//! The language-model provider contract used by the agent loop, plus a
//! scripted provider that replays canned responses.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod scripted;
pub mod traits;

pub use scripted::ScriptedProvider;
pub use traits::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, MessageContent, Provider,
    ProviderError, Role, StopReason, Tool,
};
