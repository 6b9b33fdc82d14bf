//! Stop conditions for the agent loop.

use serde::{Deserialize, Serialize};

use stepwise_core::config::StopCondition;
use stepwise_core::types::TokenUsage;

use crate::security::glob;

/// Summary of one completed step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// 0-based step index.
    pub index: u64,
    /// Text the model produced, after guardrails.
    pub text: String,
    /// Names of tools executed in this step, in order.
    pub tools_executed: Vec<String>,
    /// Tokens used by this step's model call.
    pub usage: TokenUsage,
}

/// Which condition ended the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTrigger {
    /// Position of the condition in the configured list.
    pub position: usize,
    /// The condition that fired.
    pub condition: StopCondition,
}

/// Whether one condition holds after the latest step.
#[must_use]
pub fn condition_met(condition: &StopCondition, steps: &[StepRecord], usage: &TokenUsage) -> bool {
    match condition {
        StopCondition::MaxSteps { steps: max } => steps.len() >= *max,
        StopCondition::MaxTokens { tokens } => usage.total() >= *tokens,
        StopCondition::ToolExecuted { name } => steps
            .last()
            .is_some_and(|step| step.tools_executed.iter().any(|t| t == name)),
        StopCondition::TextMatches { pattern } => steps
            .last()
            .is_some_and(|step| glob::matches(step.text.trim(), pattern)),
    }
}

/// First condition, in configured order, that holds.
#[must_use]
pub fn evaluate(
    conditions: &[StopCondition],
    steps: &[StepRecord],
    usage: &TokenUsage,
) -> Option<StopTrigger> {
    conditions
        .iter()
        .position(|c| condition_met(c, steps, usage))
        .map(|position| StopTrigger {
            position,
            condition: conditions[position].clone(),
        })
}
