//! Checkpoint inspection.

use crate::ui;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use stepwise_core::checkpoint::{Checkpoint, CheckpointStore, SledCheckpointStore};
use stepwise_core::types::RunId;

/// Checkpoint command actions.
#[derive(Debug, Clone)]
pub enum CheckpointsAction {
    /// List runs with their latest checkpoint.
    List,
    /// Show a run's latest checkpoint, or its full history.
    Show {
        /// Run to show.
        run_id: String,
        /// Print every checkpoint instead of the latest.
        history: bool,
    },
}

/// Run the checkpoints command against the store at `dir`.
pub fn run_checkpoints(action: &CheckpointsAction, dir: &Path) -> Result<()> {
    if !dir.exists() {
        ui::info(&format!("No checkpoints at {}", dir.display()));
        return Ok(());
    }

    let store = SledCheckpointStore::open(dir)
        .with_context(|| format!("Failed to open checkpoint store at {}", dir.display()))?;

    match action {
        CheckpointsAction::List => list(&store),
        CheckpointsAction::Show { run_id, history } => show(&store, &RunId::new(run_id.as_str()), *history),
    }
}

fn list(store: &dyn CheckpointStore) -> Result<()> {
    let runs = store.list_runs()?;
    if runs.is_empty() {
        ui::info("No runs recorded");
        return Ok(());
    }

    ui::header("Runs");
    ui::table_row(&[("RUN", 32), ("STEP", 8), ("STATUS", 28), ("UPDATED", 0)]);
    for run_id in runs {
        let Some(checkpoint) = store.latest(&run_id)? else {
            continue;
        };
        let step = checkpoint.step_index.to_string();
        let status = status_of(&checkpoint);
        let updated = checkpoint.created_at.to_rfc3339();
        ui::table_row(&[
            (run_id.as_ref(), 32),
            (step.as_str(), 8),
            (status.as_str(), 28),
            (updated.as_str(), 0),
        ]);
    }
    Ok(())
}

fn show(store: &dyn CheckpointStore, run_id: &RunId, history: bool) -> Result<()> {
    let checkpoints = if history {
        store.history(run_id)?
    } else {
        store.latest(run_id)?.into_iter().collect()
    };

    if checkpoints.is_empty() {
        anyhow::bail!("No checkpoints for run {run_id}");
    }

    for checkpoint in &checkpoints {
        print_checkpoint(checkpoint)?;
    }
    Ok(())
}

fn print_checkpoint(checkpoint: &Checkpoint) -> Result<()> {
    ui::header(&format!("{} @ step {}", checkpoint.run_id, checkpoint.step_index));
    ui::kv("status", &status_of(checkpoint));
    ui::kv("taken", &checkpoint.created_at.to_rfc3339());
    ui::kv("size", &format!("{} bytes", checkpoint.state.len()));

    match checkpoint.verify() {
        Ok(()) => ui::kv("digest", &checkpoint.digest),
        Err(e) => {
            ui::error(&e.to_string());
            return Ok(());
        }
    }

    let state: Value = serde_json::from_slice(&checkpoint.state)?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

/// Pending suspension first, then the status recorded in the run state.
fn status_of(checkpoint: &Checkpoint) -> String {
    if let Some(key) = &checkpoint.pending_suspension {
        return format!("suspended on {key}");
    }
    serde_json::from_slice::<Value>(&checkpoint.state)
        .ok()
        .and_then(|state| state.get("status").and_then(Value::as_str).map(ToString::to_string))
        .unwrap_or_else(|| "running".to_string())
}
