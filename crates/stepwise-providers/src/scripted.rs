//! Scripted provider.
//!
//! Replays a fixed sequence of responses and records every request it
//! receives. Used to drive the agent loop without a model.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::traits::{CompletionRequest, CompletionResponse, Provider, ProviderError};

/// Provider that returns pre-recorded responses in order.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    /// Create a provider that returns `responses` in order.
    #[must_use]
    pub fn new(responses: impl IntoIterator<Item = CompletionResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok))
    }

    /// Create a provider from responses and errors.
    #[must_use]
    pub fn with_results(
        results: impl IntoIterator<Item = Result<CompletionResponse, ProviderError>>,
    ) -> Self {
        Self {
            name: "scripted".to_string(),
            script: Mutex::new(results.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Append a response to the script.
    pub fn push(&self, result: Result<CompletionResponse, ProviderError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of completions requested.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Responses not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        tracing::debug!(messages = request.messages.len(), "Scripted completion");
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Config("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Message;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "scripted".to_string(),
            messages: vec![Message::user("hi")],
            system: None,
            max_tokens: 256,
            temperature: 0.0,
            stop: None,
            tools: None,
        }
    }

    #[tokio::test]
    async fn test_replays_in_order() {
        let provider = ScriptedProvider::new([
            CompletionResponse::from_text("one"),
            CompletionResponse::from_text("two"),
        ]);

        assert_eq!(provider.complete(request()).await.unwrap().text(), "one");
        assert_eq!(provider.complete(request()).await.unwrap().text(), "two");
        assert_eq!(provider.call_count(), 2);
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_script_errors() {
        let provider = ScriptedProvider::new([]);
        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_scripted_errors() {
        let provider = ScriptedProvider::with_results([
            Err(ProviderError::RateLimited { retry_after_secs: 1 }),
            Ok(CompletionResponse::from_text("ok")),
        ]);
        assert!(provider.complete(request()).await.is_err());
        assert!(provider.complete(request()).await.is_ok());
        assert_eq!(provider.requests()[0].messages, vec![Message::user("hi")]);
    }
}
