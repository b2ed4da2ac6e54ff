//! Periodic checkpoints: `checkpoint-<step>/` directories under the output
//! directory, each holding the adapter, the training arguments and the
//! trainer state. Older checkpoints beyond the retention limit are removed,
//! lowest step first.

use crate::args::TrainingArguments;
use crate::error::TuneError;
use crate::lora::AdaptedModel;
use crate::output::{write_json_atomic, LogEntry};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

static RE_CHECKPOINT_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^checkpoint-(\d+)$").unwrap());

/// Progress of a run, persisted as `trainer_state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub save_steps: usize,
    pub train_batch_size: usize,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn new(args: &TrainingArguments, max_steps: usize) -> Self {
        Self {
            max_steps,
            num_train_epochs: args.num_train_epochs,
            logging_steps: args.logging_steps,
            eval_steps: args.eval_steps,
            save_steps: args.save_steps,
            train_batch_size: args.per_device_train_batch_size,
            ..Default::default()
        }
    }

    pub fn save(&self, dir: &Path) -> Result<(), TuneError> {
        write_json_atomic(&dir.join("trainer_state.json"), self)
    }
}

/// `<output_dir>/checkpoint-<step>`
pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("checkpoint-{step}"))
}

/// Checkpoint directories under `output_dir`, sorted by step.
pub fn list_checkpoints(output_dir: &Path) -> Vec<(usize, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(output_dir) else {
        return Vec::new();
    };
    let mut found: Vec<(usize, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name();
            let caps = RE_CHECKPOINT_DIR.captures(name.to_str()?)?;
            let step = caps[1].parse().ok()?;
            Some((step, e.path()))
        })
        .collect();
    found.sort_by_key(|(step, _)| *step);
    found
}

/// Delete the oldest checkpoints so at most `limit` remain. The newest
/// checkpoint is always kept, even for a limit of 0.
///
/// Returns the removed directories.
pub fn rotate_checkpoints(output_dir: &Path, limit: usize) -> Result<Vec<PathBuf>, TuneError> {
    let limit = limit.max(1);
    let existing = list_checkpoints(output_dir);
    let excess = existing.len().saturating_sub(limit);
    let mut removed = Vec::with_capacity(excess);
    for (step, path) in existing.into_iter().take(excess) {
        debug!("Removing checkpoint {} (limit {})", step, limit);
        std::fs::remove_dir_all(&path).map_err(|e| TuneError::write(&path, e))?;
        removed.push(path);
    }
    Ok(removed)
}

/// Write `checkpoint-<step>/` and apply the retention limit.
pub fn save_checkpoint(
    model: &AdaptedModel,
    state: &TrainerState,
    args: &TrainingArguments,
) -> Result<PathBuf, TuneError> {
    let dir = checkpoint_dir(&args.output_dir, state.global_step);
    model.save_pretrained(&dir)?;
    write_json_atomic(&dir.join("training_args.json"), args)?;
    state.save(&dir)?;
    info!("Saved checkpoint {}", dir.display());

    if let Some(limit) = args.save_total_limit {
        rotate_checkpoints(&args.output_dir, limit)?;
    }
    Ok(dir)
}
