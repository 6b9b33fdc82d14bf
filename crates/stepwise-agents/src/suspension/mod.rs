//! Suspend/resume protocol.
//!
//! A run that needs external input records a [`SuspensionRequest`] and
//! yields. The host persists a [`SuspensionRecord`] and, once an answer
//! arrives, resumes the run. On replay, `suspend` with an already answered
//! key returns the answer immediately instead of prompting again.
//!
//! Per key: `Running → Suspended → Resolved`. Nothing in-process survives
//! a suspension; the ledger is plain serializable data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use stepwise_core::checkpoint::Checkpoint;
use stepwise_core::types::{RunId, SuspensionKey};

/// Suspension protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SuspensionError {
    /// A different suspension is already outstanding.
    #[error("Cannot suspend on '{requested}': already awaiting '{pending}'")]
    AlreadySuspended {
        /// Outstanding key.
        pending: SuspensionKey,
        /// Key of the rejected request.
        requested: SuspensionKey,
    },

    /// Resume for a key nobody is waiting on.
    #[error("No pending suspension for '{0}'")]
    NotPending(SuspensionKey),

    /// Resume for a key that already has an answer.
    #[error("Suspension '{0}' is already resolved")]
    AlreadyResolved(SuspensionKey),
}

/// A request for external input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionRequest {
    /// Key the answer must be supplied under.
    pub key: SuspensionKey,
    /// Structured prompt shown to whoever answers.
    pub payload: Value,
}

/// Outcome of a `suspend` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendPoll {
    /// The key was already answered.
    Ready(Value),
    /// The caller must yield until resumed.
    Pending(SuspensionRequest),
}

/// State of one suspension key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspensionStatus {
    /// Awaiting an answer.
    Suspended,
    /// Answered.
    Resolved,
}

/// Pending and resolved suspensions of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuspensionLedger {
    #[serde(default)]
    pending: Option<SuspensionRequest>,
    #[serde(default)]
    resolved: BTreeMap<SuspensionKey, Value>,
}

impl SuspensionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for input under `key`.
    ///
    /// Returns the stored answer if `key` was resolved earlier. Repeating
    /// the outstanding request is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySuspended` if another key is outstanding.
    pub fn suspend(
        &mut self,
        key: SuspensionKey,
        payload: Value,
    ) -> Result<SuspendPoll, SuspensionError> {
        if let Some(answer) = self.resolved.get(&key) {
            tracing::debug!(key = %key, "Suspension already resolved, replaying answer");
            return Ok(SuspendPoll::Ready(answer.clone()));
        }

        if let Some(pending) = &self.pending {
            if pending.key == key {
                return Ok(SuspendPoll::Pending(pending.clone()));
            }
            return Err(SuspensionError::AlreadySuspended {
                pending: pending.key.clone(),
                requested: key,
            });
        }

        let request = SuspensionRequest { key, payload };
        tracing::info!(key = %request.key, "Suspending for external input");
        self.pending = Some(request.clone());
        Ok(SuspendPoll::Pending(request))
    }

    /// Supply the answer for the outstanding request.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyResolved` for an answered key, `NotPending` for any
    /// other key that is not outstanding.
    pub fn resume(&mut self, key: &SuspensionKey, answer: Value) -> Result<(), SuspensionError> {
        if self.resolved.contains_key(key) {
            return Err(SuspensionError::AlreadyResolved(key.clone()));
        }

        match self.pending.take() {
            Some(pending) if &pending.key == key => {
                tracing::info!(key = %key, "Suspension resolved");
                self.resolved.insert(pending.key, answer);
                Ok(())
            }
            other => {
                self.pending = other;
                Err(SuspensionError::NotPending(key.clone()))
            }
        }
    }

    /// The outstanding request, if any.
    #[must_use]
    pub const fn pending(&self) -> Option<&SuspensionRequest> {
        self.pending.as_ref()
    }

    /// Answer recorded for `key`.
    #[must_use]
    pub fn answer(&self, key: &SuspensionKey) -> Option<&Value> {
        self.resolved.get(key)
    }

    /// Status of `key`, or `None` if it was never suspended on.
    #[must_use]
    pub fn status(&self, key: &SuspensionKey) -> Option<SuspensionStatus> {
        if self.resolved.contains_key(key) {
            Some(SuspensionStatus::Resolved)
        } else if self.pending.as_ref().is_some_and(|p| &p.key == key) {
            Some(SuspensionStatus::Suspended)
        } else {
            None
        }
    }
}

/// What the host persists for a suspended run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspensionRecord {
    /// Suspended run.
    pub run_id: RunId,
    /// Step the run is parked at.
    pub step_index: u64,
    /// Key the run awaits.
    pub awaiting_key: SuspensionKey,
}

impl SuspensionRecord {
    /// Record for a checkpoint that is waiting on input.
    #[must_use]
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Option<Self> {
        checkpoint
            .pending_suspension
            .as_ref()
            .map(|key| Self {
                run_id: checkpoint.run_id.clone(),
                step_index: checkpoint.step_index,
                awaiting_key: key.clone(),
            })
    }
}

const APPROVE_TOKENS: &[&str] = &[
    "true", "yes", "y", "approve", "approved", "allow", "ok", "accept", "confirm",
];

/// Answer to an approval prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Whether the call may proceed.
    pub approved: bool,
    /// Optional explanation from the approver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    /// Approve.
    #[must_use]
    pub const fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    /// Deny with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }

    /// Read a decision from a resume answer.
    ///
    /// Accepts booleans, approval words such as `"yes"` or `"allow"`, and
    /// objects with an `approved` (or `allowed`) flag. Anything else is a
    /// denial.
    #[must_use]
    pub fn from_answer(answer: &Value) -> Self {
        match answer {
            Value::Bool(approved) => Self {
                approved: *approved,
                reason: None,
            },
            Value::String(s) => {
                let token = s.trim().to_lowercase();
                Self {
                    approved: APPROVE_TOKENS.contains(&token.as_str()),
                    reason: None,
                }
            }
            Value::Object(obj) => Self {
                approved: obj
                    .get("approved")
                    .or_else(|| obj.get("allowed"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                reason: obj
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            },
            _ => Self {
                approved: false,
                reason: None,
            },
        }
    }

    /// Decision as a resume answer.
    #[must_use]
    pub fn to_answer(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Bool(self.approved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn key(k: &str) -> SuspensionKey {
        SuspensionKey::new(k)
    }

    #[test]
    fn test_suspend_then_resume_then_replay() {
        let mut ledger = SuspensionLedger::new();

        let poll = ledger.suspend(key("a"), json!({"q": 1})).unwrap();
        assert!(matches!(poll, SuspendPoll::Pending(ref r) if r.key == key("a")));
        assert_eq!(ledger.status(&key("a")), Some(SuspensionStatus::Suspended));

        ledger.resume(&key("a"), json!("answer")).unwrap();
        assert_eq!(ledger.status(&key("a")), Some(SuspensionStatus::Resolved));
        assert!(ledger.pending().is_none());

        let replay = ledger.suspend(key("a"), json!({"q": 1})).unwrap();
        assert_eq!(replay, SuspendPoll::Ready(json!("answer")));
        assert!(ledger.pending().is_none());
    }

    #[test]
    fn test_second_distinct_suspend_fails() {
        let mut ledger = SuspensionLedger::new();
        ledger.suspend(key("a"), json!(null)).unwrap();

        assert!(matches!(
            ledger.suspend(key("a"), json!(null)),
            Ok(SuspendPoll::Pending(_))
        ));
        assert_eq!(
            ledger.suspend(key("b"), json!(null)).unwrap_err(),
            SuspensionError::AlreadySuspended {
                pending: key("a"),
                requested: key("b"),
            }
        );
    }

    #[test]
    fn test_resume_errors() {
        let mut ledger = SuspensionLedger::new();
        assert_eq!(
            ledger.resume(&key("a"), json!(1)).unwrap_err(),
            SuspensionError::NotPending(key("a"))
        );

        ledger.suspend(key("a"), json!(null)).unwrap();
        assert!(ledger.resume(&key("b"), json!(1)).is_err());
        assert!(ledger.pending().is_some());

        ledger.resume(&key("a"), json!(1)).unwrap();
        assert_eq!(
            ledger.resume(&key("a"), json!(2)).unwrap_err(),
            SuspensionError::AlreadyResolved(key("a"))
        );
        assert_eq!(ledger.answer(&key("a")), Some(&json!(1)));
    }

    #[test]
    fn test_ledger_survives_serialization() {
        let mut ledger = SuspensionLedger::new();
        ledger.suspend(key("x"), json!({"path": "/etc"})).unwrap();

        let bytes = serde_json::to_vec(&ledger).unwrap();
        let mut restored: SuspensionLedger = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored, ledger);

        restored.resume(&key("x"), json!(true)).unwrap();
        assert_eq!(
            restored.suspend(key("x"), json!(null)).unwrap(),
            SuspendPoll::Ready(json!(true))
        );
    }

    #[test]
    fn test_record_from_checkpoint() {
        let suspended = Checkpoint::new(RunId::new("r"), 4, b"{}".to_vec(), Some(key("input:c1")));
        assert_eq!(
            SuspensionRecord::from_checkpoint(&suspended),
            Some(SuspensionRecord {
                run_id: RunId::new("r"),
                step_index: 4,
                awaiting_key: key("input:c1"),
            })
        );

        let running = Checkpoint::new(RunId::new("r"), 5, b"{}".to_vec(), None);
        assert_eq!(SuspensionRecord::from_checkpoint(&running), None);
    }

    #[test]
    fn test_approval_parsing() {
        assert!(ApprovalDecision::from_answer(&json!(true)).approved);
        assert!(ApprovalDecision::from_answer(&json!(" Yes ")).approved);
        assert!(ApprovalDecision::from_answer(&json!({"approved": true})).approved);
        assert!(ApprovalDecision::from_answer(&json!({"allowed": true})).approved);

        assert!(!ApprovalDecision::from_answer(&json!(false)).approved);
        assert!(!ApprovalDecision::from_answer(&json!("deny")).approved);
        assert!(!ApprovalDecision::from_answer(&json!(1)).approved);
        assert!(!ApprovalDecision::from_answer(&json!({})).approved);

        let denied = ApprovalDecision::from_answer(&json!({"approved": false, "reason": "no"}));
        assert_eq!(denied, ApprovalDecision::deny("no"));
        assert_eq!(
            ApprovalDecision::from_answer(&ApprovalDecision::approve().to_answer()),
            ApprovalDecision::approve()
        );
    }
}
