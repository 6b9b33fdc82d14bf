//! Workflow engine.
//!
//! Runs a workflow's steps one at a time against a shared
//! [`WorkflowState`]. Each step gets an exclusive [`StepContext`]; its
//! state edits are committed only when the step returns successfully, so
//! a step that suspends is simply re-run from its start on resume, this
//! time with `suspend` returning the stored answer.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;

use stepwise_core::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use stepwise_core::config::RetryOptions;
use stepwise_core::types::{RunId, SuspensionKey};

use crate::retry::RetryPolicy;
use crate::runtime::{RunStatus, StepInvocation};
use crate::state::{self, StateError, StateSchema, WorkflowState};
use crate::suspension::{
    SuspendPoll, SuspensionError, SuspensionLedger, SuspensionRecord, SuspensionRequest,
};

/// Default cycle protection.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Workflow execution errors.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Step not found.
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// A step failed.
    #[error("Step '{step}' failed: {message}")]
    StepFailed {
        /// Failing step.
        step: String,
        /// Failure message.
        message: String,
    },

    /// Invalid workflow definition.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Workflow not registered.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Iteration limit hit.
    #[error("Cycle detected at step: {0}")]
    CycleDetected(String),

    /// State failed validation or outgrew the size bound.
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

/// Errors returned from inside a step.
#[derive(Error, Debug)]
pub enum StepError {
    /// The step is waiting on external input.
    #[error("Suspended on '{}'", .0.key)]
    Suspended(SuspensionRequest),

    /// State update rejected.
    #[error(transparent)]
    State(#[from] StateError),

    /// Suspension protocol misuse.
    #[error(transparent)]
    Suspension(#[from] SuspensionError),

    /// Step logic failed.
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// Step failure with a message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Next,
    Goto(String),
    End,
}

/// Result of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Data handed to the next step, or the workflow output.
    pub data: Value,
    transition: Transition,
}

impl StepOutput {
    /// Continue with the next step in order.
    #[must_use]
    pub const fn next(data: Value) -> Self {
        Self {
            data,
            transition: Transition::Next,
        }
    }

    /// Continue with a specific step.
    #[must_use]
    pub fn goto(step_id: impl Into<String>, data: Value) -> Self {
        Self {
            data,
            transition: Transition::Goto(step_id.into()),
        }
    }

    /// End the workflow with `data` as its output.
    #[must_use]
    pub const fn end(data: Value) -> Self {
        Self {
            data,
            transition: Transition::End,
        }
    }
}

/// Options for [`StepContext::batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Maximum sub-invocations in flight.
    pub concurrency: usize,
    /// Drop the remaining sub-invocations on the first failure.
    pub cancel_on_failure: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            cancel_on_failure: false,
        }
    }
}

/// Execution handle for one step.
pub struct StepContext<'a> {
    run_id: &'a RunId,
    step_id: &'a str,
    schema: &'a StateSchema,
    state: WorkflowState,
    suspensions: &'a mut SuspensionLedger,
}

impl StepContext<'_> {
    /// Run this step belongs to.
    #[must_use]
    pub const fn run_id(&self) -> &RunId {
        self.run_id
    }

    /// Id of the executing step.
    #[must_use]
    pub const fn step_id(&self) -> &str {
        self.step_id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Mutable state. Validated when the step returns.
    pub fn state_mut(&mut self) -> &mut WorkflowState {
        &mut self.state
    }

    /// Shallow-merge `updates` and validate the result.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Schema` and leaves the state unchanged if the
    /// merged value does not satisfy the schema.
    pub fn update(&mut self, updates: Map<String, Value>) -> Result<(), StepError> {
        let merged = state::merge(&self.state, &updates);
        self.state = state::validate(merged.to_value(), self.schema)?;
        Ok(())
    }

    /// Wait for external input on `key`.
    ///
    /// Returns the answer once the run has been resumed with one.
    ///
    /// # Errors
    ///
    /// Returns `StepError::Suspended` while the answer is outstanding;
    /// propagate it with `?`.
    pub fn suspend(&mut self, key: impl Into<SuspensionKey>, payload: Value) -> Result<Value, StepError> {
        match self.suspensions.suspend(key.into(), payload)? {
            SuspendPoll::Ready(answer) => Ok(answer),
            SuspendPoll::Pending(request) => Err(StepError::Suspended(request)),
        }
    }

    /// Run `operation` under a retry policy.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted.
    pub async fn retry<T, E, F, Fut>(&self, options: RetryOptions, operation: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let step = self.step_id.to_string();
        RetryPolicy::<E>::new(options)
            .on_retry(move |attempt| {
                tracing::debug!(step = %step, attempt = attempt.attempt, error = %attempt.error, "Retrying");
            })
            .run(operation)
            .await
    }

    /// Run `operation` over `items` concurrently.
    ///
    /// Results come back in input order. Without `cancel_on_failure` every
    /// item runs and the first failure in input order is returned;
    /// with it, the first failure to complete drops the rest.
    ///
    /// # Errors
    ///
    /// Returns a sub-invocation's error.
    pub async fn batch<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        options: BatchOptions,
        operation: F,
    ) -> Result<Vec<R>, E>
    where
        T: Send,
        R: Send,
        E: Send,
        F: Fn(T) -> Fut + Sync,
        Fut: Future<Output = Result<R, E>> + Send,
    {
        let total = items.len();
        let semaphore = Semaphore::new(options.concurrency.max(1));
        let semaphore = &semaphore;
        let operation = &operation;

        let mut running: FuturesUnordered<_> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| async move {
                let _permit = semaphore.acquire().await;
                (index, operation(item).await)
            })
            .collect();

        let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut first_error: Option<(usize, E)> = None;

        while let Some((index, result)) = running.next().await {
            match result {
                Ok(value) => slots[index] = Some(value),
                Err(e) if options.cancel_on_failure => {
                    tracing::debug!(step = self.step_id, index, "Batch item failed, cancelling");
                    return Err(e);
                }
                Err(e) => {
                    if first_error.as_ref().is_none_or(|(i, _)| index < *i) {
                        first_error = Some((index, e));
                    }
                }
            }
        }

        match first_error {
            Some((_, e)) => Err(e),
            None => Ok(slots.into_iter().flatten().collect()),
        }
    }
}

/// A workflow step.
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    /// Step identifier, unique within the workflow.
    fn id(&self) -> &str;

    /// Execute the step.
    async fn execute(&self, ctx: &mut StepContext<'_>, input: Value) -> Result<StepOutput, StepError>;
}

/// Workflow definition.
pub struct Workflow {
    /// Workflow ID.
    pub id: String,
    /// Schema of the workflow state.
    pub schema: StateSchema,
    /// Steps in default order; the first one starts the run.
    pub steps: Vec<Arc<dyn WorkflowStep>>,
}

impl Workflow {
    /// Create an empty workflow.
    #[must_use]
    pub fn new(id: impl Into<String>, schema: StateSchema) -> Self {
        Self {
            id: id.into(),
            schema,
            steps: Vec::new(),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn with_step(mut self, step: impl WorkflowStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Find a step by ID.
    #[must_use]
    pub fn find_step(&self, id: &str) -> Option<(usize, &Arc<dyn WorkflowStep>)> {
        self.steps.iter().enumerate().find(|(_, s)| s.id() == id)
    }

    /// Check that the workflow has steps with unique IDs.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::InvalidWorkflow` otherwise.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::InvalidWorkflow(format!("'{}' has no steps", self.id)));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id()) {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "'{}' has duplicate step '{}'",
                    self.id,
                    step.id()
                )));
            }
        }
        Ok(())
    }
}

/// Opaque reference to a registered workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowHandle(String);

impl WorkflowHandle {
    /// Workflow ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Registered workflows.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Arc<Workflow>>,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow.
    ///
    /// # Errors
    ///
    /// Returns error if the workflow is invalid or its ID is taken.
    pub fn register(&mut self, workflow: Workflow) -> Result<WorkflowHandle, WorkflowError> {
        workflow.validate()?;
        if self.workflows.contains_key(&workflow.id) {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "'{}' is already registered",
                workflow.id
            )));
        }
        let handle = WorkflowHandle(workflow.id.clone());
        self.workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(handle)
    }

    /// Look up a workflow.
    #[must_use]
    pub fn get(&self, handle: &WorkflowHandle) -> Option<Arc<Workflow>> {
        self.workflows.get(&handle.0).cloned()
    }

    /// Look up a workflow by ID.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::WorkflowNotFound` if absent.
    pub fn by_id(&self, id: &str) -> Result<Arc<Workflow>, WorkflowError> {
        self.workflows
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(id.to_string()))
    }

    /// Registered workflow IDs.
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }
}

/// Checkpointed progress of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    /// Run identifier.
    pub run_id: RunId,
    /// Workflow being run.
    pub workflow_id: String,
    /// Step to execute next.
    pub current_step: String,
    /// Number of completed steps.
    pub step_index: u64,
    /// Input for the current step.
    pub input: Value,
    /// Committed state.
    pub state: WorkflowState,
    /// Suspensions of this run.
    #[serde(default)]
    pub suspensions: SuspensionLedger,
    /// Lifecycle status.
    #[serde(default)]
    pub status: RunStatus,
    /// Output once completed.
    #[serde(default)]
    pub output: Option<Value>,
}

impl WorkflowRun {
    /// Start a run with state initialized from schema defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the workflow has no steps or the defaults do not
    /// satisfy the schema.
    pub fn start(workflow: &Workflow, run_id: RunId, input: Value) -> Result<Self, WorkflowError> {
        let first = workflow
            .steps
            .first()
            .ok_or_else(|| WorkflowError::InvalidWorkflow(format!("'{}' has no steps", workflow.id)))?;

        Ok(Self {
            run_id,
            workflow_id: workflow.id.clone(),
            current_step: first.id().to_string(),
            step_index: 0,
            input,
            state: state::initialize(&workflow.schema)?,
            suspensions: SuspensionLedger::new(),
            status: RunStatus::Running,
            output: None,
        })
    }

    /// Encode through the state store, enforcing the size bound.
    ///
    /// # Errors
    ///
    /// Returns `StateError::SizeLimit` if the run outgrew the bound.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        state::serialize(&WorkflowState::capture(self)?)
    }

    /// Decode a checkpointed run, revalidating its state.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a run, or its state no longer
    /// satisfies `schema`.
    pub fn from_bytes(bytes: &[u8], schema: &StateSchema) -> Result<Self, StateError> {
        let mut run: Self = state::deserialize(bytes, None)?.to_typed()?;
        run.state = state::validate(run.state.to_value(), schema)?;
        Ok(run)
    }
}

/// How a call to [`WorkflowEngine::run`] ended.
#[derive(Debug)]
pub enum WorkflowOutcome {
    /// Finished with the last step's output.
    Completed {
        /// Output of the final step.
        output: Value,
    },
    /// Waiting for external input.
    Suspended {
        /// What was asked.
        request: SuspensionRequest,
        /// What the host must persist.
        record: SuspensionRecord,
    },
    /// Ended with an error.
    Failed(WorkflowError),
}

impl From<&WorkflowOutcome> for StepInvocation {
    fn from(outcome: &WorkflowOutcome) -> Self {
        match outcome {
            WorkflowOutcome::Completed { output } => Self::Result(output.clone()),
            WorkflowOutcome::Suspended { request, .. } => Self::SuspendedOn(request.key.clone()),
            WorkflowOutcome::Failed(error) => Self::Error(error.to_string()),
        }
    }
}

/// Workflow execution engine.
pub struct WorkflowEngine {
    max_iterations: usize,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl WorkflowEngine {
    /// Create a new workflow engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            checkpoints: None,
        }
    }

    /// Set maximum step executions per call to `run` (cycle protection).
    #[must_use]
    pub const fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Persist checkpoints to `store`.
    #[must_use]
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Latest checkpointed run.
    ///
    /// # Errors
    ///
    /// Returns error if loading fails or the checkpoint does not belong to
    /// `workflow`.
    pub fn load(&self, workflow: &Workflow, run_id: &RunId) -> Result<Option<WorkflowRun>, WorkflowError> {
        let Some(store) = &self.checkpoints else {
            return Ok(None);
        };
        let Some(checkpoint) = store.latest(run_id)? else {
            return Ok(None);
        };
        let run = WorkflowRun::from_bytes(&checkpoint.state, &workflow.schema)?;
        if run.workflow_id != workflow.id {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "run {run_id} belongs to '{}', not '{}'",
                run.workflow_id, workflow.id
            )));
        }
        Ok(Some(run))
    }

    /// Resume a suspended run with an answer and continue it.
    pub async fn resume(
        &self,
        workflow: &Workflow,
        run: &mut WorkflowRun,
        key: &SuspensionKey,
        answer: Value,
    ) -> WorkflowOutcome {
        if let Err(e) = run.suspensions.resume(key, answer) {
            return WorkflowOutcome::Failed(e.into());
        }
        run.status = RunStatus::Running;
        self.run(workflow, run).await
    }

    /// Execute steps until the run completes, suspends, or fails.
    pub async fn run(&self, workflow: &Workflow, run: &mut WorkflowRun) -> WorkflowOutcome {
        match run.status {
            RunStatus::Completed | RunStatus::Failed => {
                return WorkflowOutcome::Failed(WorkflowError::Finished(run.run_id.clone()));
            }
            RunStatus::Running | RunStatus::Suspended => {}
        }
        if let Some(request) = run.suspensions.pending().cloned() {
            return Self::suspended(run, request);
        }

        tracing::info!(
            run_id = %run.run_id,
            workflow = %workflow.id,
            step = %run.current_step,
            "Running workflow"
        );

        let mut iterations = 0;
        loop {
            iterations += 1;
            if iterations > self.max_iterations {
                let error = WorkflowError::CycleDetected(run.current_step.clone());
                return self.fail(run, error);
            }

            let Some((position, step)) = workflow.find_step(&run.current_step) else {
                let error = WorkflowError::StepNotFound(run.current_step.clone());
                return self.fail(run, error);
            };

            let mut ctx = StepContext {
                run_id: &run.run_id,
                step_id: step.id(),
                schema: &workflow.schema,
                state: run.state.clone(),
                suspensions: &mut run.suspensions,
            };

            tracing::debug!(run_id = %run.run_id, step = step.id(), "Executing step");
            let result = step.execute(&mut ctx, run.input.clone()).await;
            let edited = ctx.state;

            let output = match result {
                Ok(output) => output,
                Err(StepError::Suspended(request)) => {
                    run.status = RunStatus::Suspended;
                    if let Err(e) = self.checkpoint(run, Some(request.key.clone())) {
                        return self.fail(run, e);
                    }
                    return Self::suspended(run, request);
                }
                Err(StepError::State(e)) => return self.fail(run, e.into()),
                Err(StepError::Suspension(e)) => return self.fail(run, e.into()),
                Err(StepError::Failed(message)) => {
                    return self.fail(
                        run,
                        WorkflowError::StepFailed {
                            step: step.id().to_string(),
                            message,
                        },
                    );
                }
            };

            run.state = match state::validate(edited.to_value(), &workflow.schema) {
                Ok(validated) => validated,
                Err(e) => return self.fail(run, e.into()),
            };
            run.step_index += 1;

            let next = match output.transition {
                Transition::Next => workflow.steps.get(position + 1).map(|s| s.id().to_string()),
                Transition::Goto(id) => {
                    if workflow.find_step(&id).is_none() {
                        return self.fail(run, WorkflowError::StepNotFound(id));
                    }
                    Some(id)
                }
                Transition::End => None,
            };

            let Some(id) = next else {
                return self.complete(run, output.data);
            };
            run.current_step = id;
            run.input = output.data;

            if let Err(e) = self.checkpoint(run, None) {
                return self.fail(run, e);
            }
        }
    }

    fn checkpoint(&self, run: &WorkflowRun, pending: Option<SuspensionKey>) -> Result<(), WorkflowError> {
        let bytes = run.to_bytes()?;
        if let Some(store) = &self.checkpoints {
            store.save(&Checkpoint::new(run.run_id.clone(), run.step_index, bytes, pending))?;
        }
        Ok(())
    }

    fn suspended(run: &WorkflowRun, request: SuspensionRequest) -> WorkflowOutcome {
        tracing::info!(run_id = %run.run_id, key = %request.key, "Workflow suspended");
        let record = SuspensionRecord {
            run_id: run.run_id.clone(),
            step_index: run.step_index,
            awaiting_key: request.key.clone(),
        };
        WorkflowOutcome::Suspended { request, record }
    }

    /// Terminal states are checkpointed so a reload never re-runs the run.
    fn complete(&self, run: &mut WorkflowRun, output: Value) -> WorkflowOutcome {
        run.status = RunStatus::Completed;
        run.output = Some(output.clone());
        if let Err(e) = self.checkpoint(run, None) {
            return self.fail(run, e);
        }
        tracing::info!(run_id = %run.run_id, steps = run.step_index, "Workflow completed");
        WorkflowOutcome::Completed { output }
    }

    fn fail(&self, run: &mut WorkflowRun, error: WorkflowError) -> WorkflowOutcome {
        run.status = RunStatus::Failed;
        run.output = None;
        tracing::warn!(run_id = %run.run_id, error = %error, "Workflow failed");
        if let Err(e) = self.checkpoint(run, None) {
            tracing::warn!(run_id = %run.run_id, error = %e, "Failed run was not checkpointed");
        }
        WorkflowOutcome::Failed(error)
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}
