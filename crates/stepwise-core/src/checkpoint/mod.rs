//! Durable checkpoints for suspended and in-progress runs.
//!
//! A checkpoint is the record the orchestrator keeps between steps:
//! `{run_id, step_index, state, pending_suspension}`. Each new checkpoint
//! supersedes the previous one for the same run. The state bytes carry a
//! BLAKE2b digest so a damaged record is detected on load instead of being
//! replayed.

use blake2::{Blake2b, Digest, digest::consts::U32};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::types::{RunId, SuspensionKey};

/// Checkpoint store errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored state does not match its digest.
    #[error("Checkpoint for run {run_id} at step {step_index} is corrupted")]
    Corrupted {
        /// Run the checkpoint belongs to.
        run_id: RunId,
        /// Step index of the damaged record.
        step_index: u64,
    },
}

/// BLAKE2b-256 digest of checkpoint state, hex encoded.
#[must_use]
pub fn state_digest(state: &[u8]) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(state);
    hex::encode(hasher.finalize())
}

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run this checkpoint belongs to.
    pub run_id: RunId,
    /// Number of steps completed when the checkpoint was taken.
    pub step_index: u64,
    /// Serialized run state.
    #[serde(with = "hex_bytes")]
    pub state: Vec<u8>,
    /// Suspension the run is waiting on, if any.
    pub pending_suspension: Option<SuspensionKey>,
    /// Digest of `state`.
    pub digest: String,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint, computing the state digest.
    #[must_use]
    pub fn new(
        run_id: RunId,
        step_index: u64,
        state: Vec<u8>,
        pending_suspension: Option<SuspensionKey>,
    ) -> Self {
        let digest = state_digest(&state);
        Self {
            run_id,
            step_index,
            state,
            pending_suspension,
            digest,
            created_at: Utc::now(),
        }
    }

    /// Whether the run is waiting for a resume response.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.pending_suspension.is_some()
    }

    /// Verify the state against its digest.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointError::Corrupted` on mismatch.
    pub fn verify(&self) -> Result<(), CheckpointError> {
        if state_digest(&self.state) == self.digest {
            Ok(())
        } else {
            Err(CheckpointError::Corrupted {
                run_id: self.run_id.clone(),
                step_index: self.step_index,
            })
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Storage for checkpoints, as seen by the execution core.
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, superseding earlier ones for the run.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Latest checkpoint for a run, verified against its digest.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails or the record is corrupted.
    fn latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Every checkpoint for a run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// All runs with at least one checkpoint.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError>;
}

/// Checkpoint store backed by sled.
pub struct SledCheckpointStore {
    db: sled::Db,
    checkpoints_tree: sled::Tree,
    runs_tree: sled::Tree,
}

impl SledCheckpointStore {
    /// Open or create a checkpoint store.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        let db = sled::open(path)?;
        let checkpoints_tree = db.open_tree("checkpoints")?;
        let runs_tree = db.open_tree("runs")?;

        Ok(Self {
            db,
            checkpoints_tree,
            runs_tree,
        })
    }

    fn run_prefix(run_id: &RunId) -> Vec<u8> {
        let mut prefix = run_id.as_ref().as_bytes().to_vec();
        prefix.push(0);
        prefix
    }

    fn checkpoint_key(run_id: &RunId, step_index: u64) -> Vec<u8> {
        let mut key = Self::run_prefix(run_id);
        key.extend_from_slice(&step_index.to_be_bytes());
        key
    }

    /// Flush all pending writes to disk.
    ///
    /// # Errors
    ///
    /// Returns error if flush fails.
    pub fn flush(&self) -> Result<(), CheckpointError> {
        self.db.flush()?;
        Ok(())
    }
}

impl CheckpointStore for SledCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let key = Self::checkpoint_key(&checkpoint.run_id, checkpoint.step_index);
        let data = serde_json::to_vec(checkpoint)?;

        self.checkpoints_tree.insert(key, data)?;
        self.runs_tree
            .insert(checkpoint.run_id.as_ref().as_bytes(), &checkpoint.step_index.to_be_bytes())?;

        tracing::debug!(
            run_id = %checkpoint.run_id,
            step = checkpoint.step_index,
            suspended = checkpoint.is_suspended(),
            bytes = checkpoint.state.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    fn latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>, CheckpointError> {
        let prefix = Self::run_prefix(run_id);

        match self.checkpoints_tree.scan_prefix(prefix).next_back() {
            Some(result) => {
                let (_, value) = result?;
                let checkpoint: Checkpoint = serde_json::from_slice(&value)?;
                checkpoint.verify()?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let prefix = Self::run_prefix(run_id);
        let mut checkpoints = Vec::new();

        for result in self.checkpoints_tree.scan_prefix(prefix) {
            let (_, value) = result?;
            checkpoints.push(serde_json::from_slice(&value)?);
        }

        Ok(checkpoints)
    }

    fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError> {
        let mut runs = Vec::new();

        for result in &self.runs_tree {
            let (key, _) = result?;
            if let Ok(key_str) = std::str::from_utf8(&key) {
                runs.push(RunId::new(key_str));
            }
        }

        Ok(runs)
    }
}

/// In-memory checkpoint store for tests and single-process hosts.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: RwLock<BTreeMap<RunId, BTreeMap<u64, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.entry(checkpoint.run_id.clone())
            .or_default()
            .insert(checkpoint.step_index, checkpoint.clone());
        Ok(())
    }

    fn latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>, CheckpointError> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        let latest = runs
            .get(run_id)
            .and_then(|steps| steps.values().next_back())
            .cloned();

        if let Some(checkpoint) = &latest {
            checkpoint.verify()?;
        }
        Ok(latest)
    }

    fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(runs
            .get(run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError> {
        let runs = self.runs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.keys().cloned().collect())
    }
}
