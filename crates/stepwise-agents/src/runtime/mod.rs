//! Agent runtime.
//!
//! Drives the tool-calling loop for one run:
//!
//! ```text
//! Start → (ModelCall → Guardrails → [ToolExecution]* → StopCheck)*
//!       → Completed | Suspended | Failed
//! ```
//!
//! All progress lives in [`RunState`], which is checkpointed after every
//! step and whenever a tool suspends. A suspended run is continued by
//! [`resume_run`] followed by [`AgentRuntime::run`]; the interrupted turn
//! picks up at the first tool call without a result, so no model call is
//! repeated and no finished tool call runs twice.

pub mod stop;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use stepwise_core::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use stepwise_core::config::{AgentConfig, RetryOptions, StopCondition};
use stepwise_core::types::{RunId, SuspensionKey, TokenUsage, ToolCallId};
use stepwise_providers::traits::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, Provider, ProviderError,
};

use crate::guardrails::{GuardrailContext, GuardrailFailure, GuardrailPipeline, ModelTurn};
use crate::retry::RetryPolicy;
use crate::state::{self, StateError, WorkflowState};
use crate::suspension::{SuspensionError, SuspensionLedger, SuspensionRecord, SuspensionRequest};
use crate::tools::{ToolCall, ToolExecutor, ToolOutput, ToolResult};

pub use stop::{StepRecord, StopTrigger};

/// Agent runtime errors.
#[derive(Debug, Error)]
pub enum AgentRuntimeError {
    /// Provider error, after retries.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A guardrail failed the turn.
    #[error(transparent)]
    Guardrail(#[from] GuardrailFailure),

    /// Run state could not be persisted.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Checkpoint store failure.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Suspension protocol misuse.
    #[error(transparent)]
    Suspension(#[from] SuspensionError),

    /// The run already completed or failed.
    #[error("Run {0} has already finished")]
    Finished(RunId),
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Not yet finished.
    #[default]
    Running,
    /// Waiting for a resume answer.
    Suspended,
    /// Ended normally.
    Completed,
    /// Ended with an error.
    Failed,
}

/// Result of one executed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedCall {
    /// Call the result belongs to.
    pub call_id: ToolCallId,
    /// Tool that ran.
    pub tool_name: String,
    /// What it returned.
    pub result: ToolResult,
}

/// A model turn whose tool calls have not all finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTurn {
    /// Turn after guardrails.
    pub turn: ModelTurn,
    /// Results so far, in call order.
    pub results: Vec<CompletedCall>,
    /// Tokens used by the model call that produced the turn.
    pub usage: TokenUsage,
}

impl PendingTurn {
    fn remaining_calls(&self) -> &[ToolCall] {
        &self.turn.tool_calls[self.results.len().min(self.turn.tool_calls.len())..]
    }
}

/// Checkpointed state of an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// Run identifier.
    pub run_id: RunId,
    /// Number of completed steps.
    pub step_index: u64,
    /// Conversation so far.
    pub messages: Vec<Message>,
    /// Cumulative token usage.
    pub usage: TokenUsage,
    /// Completed steps.
    pub steps: Vec<StepRecord>,
    /// Turn interrupted by a suspension.
    #[serde(default)]
    pub pending_turn: Option<PendingTurn>,
    /// Suspensions of this run.
    #[serde(default)]
    pub suspensions: SuspensionLedger,
    /// Lifecycle status.
    #[serde(default)]
    pub status: RunStatus,
}

impl RunState {
    /// Start a run from a user prompt.
    #[must_use]
    pub fn new(run_id: RunId, prompt: impl Into<String>) -> Self {
        Self {
            run_id,
            step_index: 0,
            messages: vec![Message::user(prompt)],
            usage: TokenUsage::default(),
            steps: Vec::new(),
            pending_turn: None,
            suspensions: SuspensionLedger::new(),
            status: RunStatus::Running,
        }
    }

    /// Restore a run from a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the checkpoint does not hold a run state.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Self, StateError> {
        state::deserialize(&checkpoint.state, None)?.to_typed()
    }

    /// Text of the latest step.
    #[must_use]
    pub fn last_text(&self) -> &str {
        self.steps.last().map_or("", |s| s.text.as_str())
    }

    /// Encode through the state store, enforcing the size bound.
    ///
    /// # Errors
    ///
    /// Returns `StateError::SizeLimit` if the run outgrew the bound.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        state::serialize(&WorkflowState::capture(self)?)
    }
}

/// Supply the answer to a suspended run.
///
/// Pure: the returned state is the next input to [`AgentRuntime::run`].
///
/// # Errors
///
/// Returns `SuspensionError` if `key` is not what the run awaits.
pub fn resume_run(
    mut state: RunState,
    key: &SuspensionKey,
    answer: Value,
) -> Result<RunState, SuspensionError> {
    state.suspensions.resume(key, answer)?;
    state.status = RunStatus::Running;
    Ok(state)
}

/// How a call to [`AgentRuntime::run`] ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Finished normally.
    Completed {
        /// Final text of the model.
        text: String,
        /// Stop condition that fired; `None` when the model stopped calling tools.
        stop: Option<StopTrigger>,
    },
    /// Waiting for external input.
    Suspended {
        /// What was asked.
        request: SuspensionRequest,
        /// What the host must persist.
        record: SuspensionRecord,
    },
    /// Ended with an error.
    Failed(AgentRuntimeError),
}

/// Outward result of a step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepInvocation {
    /// Finished with a value.
    Result(Value),
    /// Suspended on a key.
    SuspendedOn(SuspensionKey),
    /// Failed with a message.
    Error(String),
}

impl From<&RunOutcome> for StepInvocation {
    fn from(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed { text, stop } => Self::Result(json!({
                "text": text,
                "stopCondition": stop.as_ref().map(|s| s.condition.id()),
            })),
            RunOutcome::Suspended { request, .. } => Self::SuspendedOn(request.key.clone()),
            RunOutcome::Failed(error) => Self::Error(error.to_string()),
        }
    }
}

/// Agent runtime for executing agent logic.
pub struct AgentRuntime {
    provider: Arc<dyn Provider>,
    tools: ToolExecutor,
    guardrails: GuardrailPipeline,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    model: String,
    system_prompt: Option<String>,
    max_tokens: u32,
    temperature: f32,
    stop_conditions: Vec<StopCondition>,
    retry: RetryOptions,
}

impl AgentRuntime {
    /// Create a new agent runtime with default agent settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, tools: ToolExecutor) -> Self {
        Self::from_config(provider, tools, &AgentConfig::default())
    }

    /// Create a runtime from an agent configuration.
    #[must_use]
    pub fn from_config(provider: Arc<dyn Provider>, tools: ToolExecutor, config: &AgentConfig) -> Self {
        Self {
            provider,
            tools,
            guardrails: GuardrailPipeline::new(),
            checkpoints: None,
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            stop_conditions: config.stop_conditions.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Set the model to use.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the guardrail pipeline.
    #[must_use]
    pub fn with_guardrails(mut self, guardrails: GuardrailPipeline) -> Self {
        self.guardrails = guardrails;
        self
    }

    /// Set stop conditions, evaluated in order.
    #[must_use]
    pub fn with_stop_conditions(mut self, conditions: Vec<StopCondition>) -> Self {
        self.stop_conditions = conditions;
        self
    }

    /// Set the retry policy for model calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Persist checkpoints to `store`.
    #[must_use]
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Get the model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the tool executor.
    #[must_use]
    pub const fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    /// Latest checkpointed state of a run.
    ///
    /// # Errors
    ///
    /// Returns error if no store is attached, or loading fails.
    pub fn load(&self, run_id: &RunId) -> Result<Option<RunState>, AgentRuntimeError> {
        let Some(store) = &self.checkpoints else {
            return Ok(None);
        };
        match store.latest(run_id)? {
            Some(checkpoint) => Ok(Some(RunState::from_checkpoint(&checkpoint)?)),
            None => Ok(None),
        }
    }

    /// Resume a suspended run with an answer and continue it.
    pub async fn resume(
        &self,
        state: &mut RunState,
        key: &SuspensionKey,
        answer: Value,
    ) -> RunOutcome {
        if let Err(e) = state.suspensions.resume(key, answer) {
            return RunOutcome::Failed(e.into());
        }
        state.status = RunStatus::Running;
        self.run(state).await
    }

    /// Drive the run until it completes, suspends, or fails.
    pub async fn run(&self, state: &mut RunState) -> RunOutcome {
        match state.status {
            RunStatus::Completed | RunStatus::Failed => {
                return RunOutcome::Failed(AgentRuntimeError::Finished(state.run_id.clone()));
            }
            RunStatus::Suspended | RunStatus::Running => {}
        }

        if let Some(request) = state.suspensions.pending().cloned() {
            return self.suspended(state, request);
        }

        tracing::info!(run_id = %state.run_id, step = state.step_index, "Running agent");

        loop {
            let mut pending = match state.pending_turn.take() {
                Some(pending) => pending,
                None => match self.next_turn(state).await {
                    Ok(pending) => pending,
                    Err(e) => return self.fail(state, e),
                },
            };

            let remaining = pending.remaining_calls().to_vec();
            for call in remaining {
                if pending.results.iter().any(|c| c.call_id == call.id) {
                    pending.results.push(CompletedCall {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        result: ToolResult::error(format!("Duplicate tool call id: {}", call.id)),
                    });
                    continue;
                }
                match self.tools.execute(&call, state.step_index, &mut state.suspensions).await {
                    ToolOutput::Result(result) => pending.results.push(CompletedCall {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        result,
                    }),
                    ToolOutput::Suspended(request) => {
                        state.pending_turn = Some(pending);
                        state.status = RunStatus::Suspended;
                        if let Err(e) = self.checkpoint(state, Some(request.key.clone())) {
                            return self.fail(state, e);
                        }
                        return self.suspended(state, request);
                    }
                }
            }

            let natural_end = pending.turn.tool_calls.is_empty();
            self.finish_step(state, pending);

            if let Some(trigger) = stop::evaluate(&self.stop_conditions, &state.steps, &state.usage) {
                tracing::info!(
                    run_id = %state.run_id,
                    condition = trigger.condition.id(),
                    "Stop condition met"
                );
                return self.complete(state, Some(trigger));
            }
            if natural_end {
                return self.complete(state, None);
            }

            if let Err(e) = self.checkpoint(state, None) {
                return self.fail(state, e);
            }
        }
    }

    async fn next_turn(&self, state: &mut RunState) -> Result<PendingTurn, AgentRuntimeError> {
        let response = self.call_model(state).await?;
        state.usage.accumulate(&response.usage);

        let turn = model_turn(&response);
        let ctx = GuardrailContext {
            run_id: &state.run_id,
            step_index: state.step_index,
            usage: &state.usage,
        };
        let turn = self.guardrails.run(&ctx, turn)?;

        state.messages.push(Message::assistant(assistant_blocks(&turn)));
        Ok(PendingTurn {
            turn,
            results: Vec::new(),
            usage: response.usage,
        })
    }

    async fn call_model(&self, state: &RunState) -> Result<CompletionResponse, ProviderError> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: state.messages.clone(),
            system: self.system_prompt.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stop: None,
            tools: Some(self.tools.registry().as_tool_definitions()),
        };

        let run_id = state.run_id.clone();
        let policy = RetryPolicy::new(self.retry.clone())
            .retry_if(ProviderError::is_transient)
            .on_retry(move |attempt| {
                tracing::warn!(
                    run_id = %run_id,
                    attempt = attempt.attempt,
                    error = %attempt.error,
                    "Model call failed, retrying"
                );
            });

        policy
            .run(|| {
                let provider = Arc::clone(&self.provider);
                let request = request.clone();
                async move { provider.complete(request).await }
            })
            .await
    }

    fn finish_step(&self, state: &mut RunState, pending: PendingTurn) {
        if !pending.results.is_empty() {
            let blocks = pending
                .results
                .iter()
                .map(|c| ContentBlock::ToolResult {
                    tool_use_id: c.call_id.to_string(),
                    content: c.result.model_content(),
                    is_error: Some(!c.result.success),
                })
                .collect();
            state.messages.push(Message::tool_results(blocks));
        }

        tracing::debug!(
            run_id = %state.run_id,
            step = state.step_index,
            tools = pending.results.len(),
            model = %self.model,
            "Step completed"
        );

        state.steps.push(StepRecord {
            index: state.step_index,
            text: pending.turn.content,
            tools_executed: pending.results.into_iter().map(|c| c.tool_name).collect(),
            usage: pending.usage,
        });
        state.step_index += 1;
    }

    fn checkpoint(
        &self,
        state: &RunState,
        pending: Option<SuspensionKey>,
    ) -> Result<(), AgentRuntimeError> {
        let bytes = state.to_bytes()?;
        if let Some(store) = &self.checkpoints {
            store.save(&Checkpoint::new(
                state.run_id.clone(),
                state.step_index,
                bytes,
                pending,
            ))?;
        }
        Ok(())
    }

    fn suspended(&self, state: &RunState, request: SuspensionRequest) -> RunOutcome {
        tracing::info!(run_id = %state.run_id, key = %request.key, "Run suspended");
        let record = SuspensionRecord {
            run_id: state.run_id.clone(),
            step_index: state.step_index,
            awaiting_key: request.key.clone(),
        };
        RunOutcome::Suspended { request, record }
    }

    /// Terminal states are checkpointed so a reload never re-runs the run.
    fn complete(&self, state: &mut RunState, stop: Option<StopTrigger>) -> RunOutcome {
        state.status = RunStatus::Completed;
        if let Err(e) = self.checkpoint(state, None) {
            return self.fail(state, e);
        }
        tracing::info!(
            run_id = %state.run_id,
            steps = state.step_index,
            tokens = state.usage.total(),
            "Run completed"
        );
        RunOutcome::Completed {
            text: state.last_text().to_string(),
            stop,
        }
    }

    fn fail(&self, state: &mut RunState, error: AgentRuntimeError) -> RunOutcome {
        state.status = RunStatus::Failed;
        state.pending_turn = None;
        tracing::warn!(run_id = %state.run_id, error = %error, "Run failed");
        if let Err(e) = self.checkpoint(state, None) {
            tracing::warn!(run_id = %state.run_id, error = %e, "Failed run was not checkpointed");
        }
        RunOutcome::Failed(error)
    }
}

fn model_turn(response: &CompletionResponse) -> ModelTurn {
    let tool_calls = response
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                Some(ToolCall::new(id.clone(), name.clone(), input.clone()))
            }
            _ => None,
        })
        .collect();

    ModelTurn {
        content: response.text(),
        tool_calls,
    }
}

fn assistant_blocks(turn: &ModelTurn) -> Vec<ContentBlock> {
    let mut blocks = Vec::with_capacity(turn.tool_calls.len() + 1);
    if !turn.content.is_empty() {
        blocks.push(ContentBlock::Text {
            text: turn.content.clone(),
        });
    }
    blocks.extend(turn.tool_calls.iter().map(|call| ContentBlock::ToolUse {
        id: call.id.to_string(),
        name: call.name.clone(),
        input: call.arguments.clone(),
    }));
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    use stepwise_core::checkpoint::MemoryCheckpointStore;
    use stepwise_core::config::RestrictionConfig;
    use stepwise_providers::scripted::ScriptedProvider;
    use stepwise_providers::traits::MessageContent;

    use crate::guardrails::{BlockedTools, FnGuardrail, GuardrailResult};
    use crate::testing::MockEnvironment;
    use crate::tools::{Tool, ToolContext, ToolError, ToolRegistry, register_builtin_tools};

    fn tool_use(id: &str, name: &str, input: Value) -> CompletionResponse {
        CompletionResponse::from_blocks(vec![ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }])
    }

    fn executor(env: Arc<MockEnvironment>, registry: ToolRegistry) -> ToolExecutor {
        let restriction = RestrictionConfig::new("/workspace").with_allowlist(["git *"]);
        ToolExecutor::new(
            Arc::new(registry),
            env,
            Arc::new(restriction),
            PathBuf::from("/workspace"),
        )
    }

    fn builtin_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry);
        registry
    }

    fn runtime(provider: &Arc<ScriptedProvider>, env: &Arc<MockEnvironment>) -> AgentRuntime {
        AgentRuntime::new(
            Arc::clone(provider) as Arc<dyn Provider>,
            executor(Arc::clone(env), builtin_registry()),
        )
        .with_retry(RetryOptions::no_retry())
    }

    fn last_tool_result(state: &RunState) -> (String, bool) {
        let Some(Message {
            content: MessageContent::Blocks(blocks),
            ..
        }) = state.messages.last()
        else {
            panic!("expected block message");
        };
        match &blocks[0] {
            ContentBlock::ToolResult {
                content, is_error, ..
            } => (content.clone(), is_error.unwrap_or(false)),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completes_without_tool_calls() {
        let provider = Arc::new(ScriptedProvider::new([
            CompletionResponse::from_text("Hello").with_usage(TokenUsage::new(5, 2)),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env);

        let mut state = RunState::new(RunId::new("r1"), "hi");
        let outcome = runtime.run(&mut state).await;

        assert!(matches!(outcome, RunOutcome::Completed { ref text, stop: None } if text == "Hello"));
        assert_eq!(state.step_index, 1);
        assert_eq!(state.usage.total(), 7);
        assert_eq!(state.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_tool_result_fed_back_to_model() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_use("call_1", "get_cwd", json!({})),
            CompletionResponse::from_text("You are in /workspace"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env);

        let mut state = RunState::new(RunId::new("r1"), "where am I?");
        let outcome = runtime.run(&mut state).await;

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(provider.call_count(), 2);

        let second = &provider.requests()[1];
        let Some(Message {
            content: MessageContent::Blocks(blocks),
            ..
        }) = second.messages.last()
        else {
            panic!("expected tool results");
        };
        assert_eq!(
            blocks[0],
            ContentBlock::ToolResult {
                tool_use_id: "call_1".into(),
                content: "/workspace".into(),
                is_error: Some(false),
            }
        );
        assert_eq!(state.steps[0].tools_executed, vec!["get_cwd"]);
    }

    #[tokio::test]
    async fn test_tool_errors_do_not_fail_run() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_use("call_1", "no_such_tool", json!({})),
            CompletionResponse::from_text("ok"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env);

        let mut state = RunState::new(RunId::new("r1"), "go");
        let mut outcome = runtime.run(&mut state).await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        // Step 0's results sit just before the final assistant message.
        state.messages.pop();
        let (content, is_error) = last_tool_result(&state);
        assert!(is_error);
        assert_eq!(content, "Tool not found: no_such_tool");

        outcome = runtime.run(&mut state).await;
        assert!(matches!(outcome, RunOutcome::Failed(AgentRuntimeError::Finished(_))));
    }

    #[tokio::test]
    async fn test_guardrail_failure_stops_before_tools() {
        let provider = Arc::new(ScriptedProvider::new([tool_use(
            "call_1",
            "exec",
            json!({"command": "git status"}),
        )]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env)
            .with_guardrails(GuardrailPipeline::new().with(BlockedTools::new(["exec"])));

        let mut state = RunState::new(RunId::new("r1"), "go");
        let outcome = runtime.run(&mut state).await;

        let RunOutcome::Failed(AgentRuntimeError::Guardrail(failure)) = outcome else {
            panic!("expected guardrail failure");
        };
        assert_eq!(failure.guardrail, "blocked_tools");
        assert_eq!(env.execs(), 0);
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_guardrail_rewrite_reaches_execution() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_use("call_1", "exec", json!({"command": "git push --force"})),
            CompletionResponse::from_text("done"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env).with_guardrails(GuardrailPipeline::new().with(
            FnGuardrail::new("soften", |_, turn| GuardrailResult::ContinueWith {
                content: None,
                tool_calls: Some(
                    turn.tool_calls
                        .iter()
                        .map(|c| ToolCall::new(c.id.to_string(), "exec", json!({"command": "git status"})))
                        .collect(),
                ),
            }),
        ));

        let mut state = RunState::new(RunId::new("r1"), "go");
        assert!(matches!(runtime.run(&mut state).await, RunOutcome::Completed { .. }));
        assert_eq!(env.execs(), 1);
    }

    #[tokio::test]
    async fn test_stop_condition_ends_run() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_use("call_1", "get_cwd", json!({})),
            tool_use("call_2", "get_cwd", json!({})),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env).with_stop_conditions(vec![
            StopCondition::MaxTokens { tokens: 1_000 },
            StopCondition::ToolExecuted {
                name: "get_cwd".into(),
            },
            StopCondition::MaxSteps { steps: 1 },
        ]);

        let mut state = RunState::new(RunId::new("r1"), "go");
        let RunOutcome::Completed { stop: Some(trigger), .. } = runtime.run(&mut state).await else {
            panic!("expected stop condition");
        };
        assert_eq!(trigger.position, 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_provider_errors_retry() {
        let provider = Arc::new(ScriptedProvider::with_results([
            Err(ProviderError::Api {
                status: 503,
                message: "overloaded".into(),
            }),
            Ok(CompletionResponse::from_text("ok")),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env).with_retry(RetryOptions::default());

        let mut state = RunState::new(RunId::new("r1"), "go");
        assert!(matches!(runtime.run(&mut state).await, RunOutcome::Completed { .. }));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_provider_error_fails() {
        let provider = Arc::new(ScriptedProvider::with_results([Err(ProviderError::Api {
            status: 401,
            message: "bad key".into(),
        })]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env).with_retry(RetryOptions::default());

        let mut state = RunState::new(RunId::new("r1"), "go");
        assert!(matches!(
            runtime.run(&mut state).await,
            RunOutcome::Failed(AgentRuntimeError::Provider(_))
        ));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_suspend_and_approve_across_restart() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let provider = Arc::new(ScriptedProvider::new([
            CompletionResponse::from_blocks(vec![
                ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "get_cwd".into(),
                    input: json!({}),
                },
                ContentBlock::ToolUse {
                    id: "call_2".into(),
                    name: "read_file".into(),
                    input: json!({"path": "/etc/hosts"}),
                },
            ]),
            CompletionResponse::from_text("read it"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let first = runtime(&provider, &env).with_checkpoints(Arc::clone(&store));

        let run_id = RunId::new("r1");
        let mut state = RunState::new(run_id.clone(), "read hosts");
        let RunOutcome::Suspended { request, record } = first.run(&mut state).await else {
            panic!("expected suspension");
        };
        assert_eq!(request.key.as_ref(), "approval:0:call_2");
        assert_eq!(record.step_index, 0);
        assert_eq!(env.reads(), 0);
        drop(first);

        let checkpoint = store.latest(&run_id).unwrap().unwrap();
        assert_eq!(checkpoint.pending_suspension, Some(request.key.clone()));
        assert_eq!(SuspensionRecord::from_checkpoint(&checkpoint), Some(record));

        let second = runtime(&provider, &env).with_checkpoints(Arc::clone(&store));
        let restored = second.load(&run_id).unwrap().unwrap();
        assert_eq!(restored, state);

        let mut resumed = resume_run(restored, &request.key, json!({"approved": true})).unwrap();
        let outcome = second.run(&mut resumed).await;

        assert!(matches!(outcome, RunOutcome::Completed { ref text, .. } if text == "read it"));
        assert_eq!(env.reads(), 1);
        assert_eq!(provider.call_count(), 2);
        assert_eq!(resumed.steps[0].tools_executed, vec!["get_cwd", "read_file"]);
        assert!(!store.latest(&run_id).unwrap().unwrap().is_suspended());
        assert_eq!(second.load(&run_id).unwrap().unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_approval_does_not_carry_to_reused_call_id() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_use("call_0", "read_file", json!({"path": "/etc/hosts"})),
            tool_use("call_0", "exec", json!({"command": "rm -rf /"})),
            CompletionResponse::from_text("unreachable"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env);

        let mut state = RunState::new(RunId::new("r1"), "go");
        let RunOutcome::Suspended { request, .. } = runtime.run(&mut state).await else {
            panic!("expected suspension");
        };
        assert_eq!(request.key.as_ref(), "approval:0:call_0");

        let outcome = runtime.resume(&mut state, &request.key, json!({"approved": true})).await;
        let RunOutcome::Suspended { request, record } = outcome else {
            panic!("second turn must ask again");
        };
        assert_eq!(request.key.as_ref(), "approval:1:call_0");
        assert_eq!(request.payload["command"], "rm -rf /");
        assert_eq!(record.step_index, 1);
        assert_eq!(env.reads(), 1);
        assert_eq!(env.execs(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_call_id_in_one_turn_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new([
            CompletionResponse::from_blocks(vec![
                ContentBlock::ToolUse {
                    id: "call_0".into(),
                    name: "exec".into(),
                    input: json!({"command": "git status"}),
                },
                ContentBlock::ToolUse {
                    id: "call_0".into(),
                    name: "exec".into(),
                    input: json!({"command": "git status"}),
                },
            ]),
            CompletionResponse::from_text("done"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env);

        let mut state = RunState::new(RunId::new("r1"), "go");
        assert!(matches!(runtime.run(&mut state).await, RunOutcome::Completed { .. }));
        assert_eq!(env.execs(), 1);
        assert_eq!(state.steps[0].tools_executed, vec!["exec", "exec"]);
    }

    #[tokio::test]
    async fn test_completed_run_reloads_as_completed() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let provider = Arc::new(ScriptedProvider::new([
            CompletionResponse::from_text("Hello"),
            CompletionResponse::from_text("again"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env).with_checkpoints(Arc::clone(&store));

        let run_id = RunId::new("r1");
        let mut state = RunState::new(run_id.clone(), "hi");
        assert!(matches!(runtime.run(&mut state).await, RunOutcome::Completed { .. }));

        let mut restored = runtime.load(&run_id).unwrap().unwrap();
        assert_eq!(restored.status, RunStatus::Completed);
        assert_eq!(restored, state);
        assert!(matches!(
            runtime.run(&mut restored).await,
            RunOutcome::Failed(AgentRuntimeError::Finished(_))
        ));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_after_resume_reloads_as_failed() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let provider = Arc::new(ScriptedProvider::with_results([
            Ok(tool_use("call_1", "ask_user", json!({"question": "Proceed?"}))),
            Err(ProviderError::Api {
                status: 401,
                message: "bad key".into(),
            }),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env).with_checkpoints(Arc::clone(&store));

        let run_id = RunId::new("r1");
        let mut state = RunState::new(run_id.clone(), "go");
        let RunOutcome::Suspended { request, .. } = runtime.run(&mut state).await else {
            panic!("expected suspension");
        };

        let outcome = runtime.resume(&mut state, &request.key, json!("yes")).await;
        assert!(matches!(outcome, RunOutcome::Failed(AgentRuntimeError::Provider(_))));

        let checkpoint = store.latest(&run_id).unwrap().unwrap();
        assert!(!checkpoint.is_suspended());
        let mut restored = runtime.load(&run_id).unwrap().unwrap();
        assert_eq!(restored.status, RunStatus::Failed);
        assert!(matches!(
            runtime.run(&mut restored).await,
            RunOutcome::Failed(AgentRuntimeError::Finished(_))
        ));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_denied_approval_is_tool_error() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_use("call_1", "exec", json!({"command": "rm -rf /"})),
            CompletionResponse::from_text("understood"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env);

        let mut state = RunState::new(RunId::new("r1"), "clean up");
        let RunOutcome::Suspended { request, .. } = runtime.run(&mut state).await else {
            panic!("expected suspension");
        };

        let outcome = runtime.resume(&mut state, &request.key, json!({"approved": false})).await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(env.execs(), 0);

        state.messages.pop();
        let (content, is_error) = last_tool_result(&state);
        assert!(is_error);
        assert!(content.starts_with("Permission denied"));
    }

    #[tokio::test]
    async fn test_ask_user_roundtrip() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_use("call_1", "ask_user", json!({"question": "Proceed?"})),
            CompletionResponse::from_text("proceeding"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let runtime = runtime(&provider, &env);

        let mut state = RunState::new(RunId::new("r1"), "go");
        let RunOutcome::Suspended { request, .. } = runtime.run(&mut state).await else {
            panic!("expected suspension");
        };
        assert_eq!(request.payload["question"], "Proceed?");

        // Running again without an answer stays suspended.
        assert!(matches!(runtime.run(&mut state).await, RunOutcome::Suspended { .. }));
        assert_eq!(provider.call_count(), 1);

        let outcome = runtime.resume(&mut state, &request.key, json!("yes")).await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(
            StepInvocation::from(&outcome),
            StepInvocation::Result(json!({"text": "proceeding", "stopCondition": null}))
        );
    }

    #[test]
    fn test_resume_run_is_pure_and_checked() {
        let mut state = RunState::new(RunId::new("r1"), "go");
        state
            .suspensions
            .suspend(SuspensionKey::new("input:c1"), json!({}))
            .unwrap();

        assert!(resume_run(state.clone(), &SuspensionKey::new("input:other"), json!(1)).is_err());
        let resumed = resume_run(state.clone(), &SuspensionKey::new("input:c1"), json!(1)).unwrap();
        assert!(resumed.suspensions.pending().is_none());
        assert!(state.suspensions.pending().is_some());
    }

    /// Tool that returns a result too large to checkpoint.
    struct HugeTool;

    #[async_trait]
    impl Tool for HugeTool {
        fn name(&self) -> &str {
            "huge"
        }

        fn description(&self) -> &str {
            "returns a lot"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _params: Value,
            _ctx: &mut ToolContext<'_>,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::Result(ToolResult::success(
                "x".repeat(state::MAX_STATE_BYTES),
            )))
        }
    }

    #[tokio::test]
    async fn test_oversized_state_fails_run() {
        let provider = Arc::new(ScriptedProvider::new([
            tool_use("call_1", "huge", json!({})),
            CompletionResponse::from_text("unreachable"),
        ]));
        let env = Arc::new(MockEnvironment::default());
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(HugeTool));
        let runtime = AgentRuntime::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            executor(env, registry),
        );

        let mut state = RunState::new(RunId::new("r1"), "go");
        assert!(matches!(
            runtime.run(&mut state).await,
            RunOutcome::Failed(AgentRuntimeError::State(StateError::SizeLimit { .. }))
        ));
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn test_step_invocation_wire_format() {
        let suspended = StepInvocation::SuspendedOn(SuspensionKey::new("approval:c1"));
        assert_eq!(
            serde_json::to_value(&suspended).unwrap(),
            json!({"suspendedOn": "approval:c1"})
        );
        let error = StepInvocation::Error("boom".into());
        assert_eq!(serde_json::to_value(&error).unwrap(), json!({"error": "boom"}));
    }
}
