//! Run outputs: dataset statistics, the metric log, the final summary and
//! the JSON files written next to the adapter.

use crate::error::TuneError;
use crate::lora::ParameterCounts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sizes of the dataset at each preparation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub source: PathBuf,
    /// Records in the source file.
    pub total: usize,
    /// Records left after the subset filter.
    pub filtered: usize,
    pub train: usize,
    pub eval: usize,
}

/// One row of the metric history, as kept in `trainer_state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f32>,
}

impl LogEntry {
    /// Flatten to named scalars for the experiment tracker.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("epoch".to_string(), self.epoch);
        if let Some(v) = self.loss {
            m.insert("train/loss".to_string(), f64::from(v));
        }
        if let Some(v) = self.learning_rate {
            m.insert("train/learning_rate".to_string(), v);
        }
        if let Some(v) = self.grad_norm {
            m.insert("train/grad_norm".to_string(), v);
        }
        if let Some(v) = self.eval_loss {
            m.insert("eval/loss".to_string(), f64::from(v));
        }
        m
    }
}

/// Throughput and loss for the whole run, keyed the way `train_results.json`
/// spells them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub train_runtime: f64,
    pub train_samples_per_second: f64,
    pub train_steps_per_second: f64,
    pub train_loss: f32,
    pub epoch: f64,
}

/// Everything the driver reports when a run completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub run_name: String,
    pub output_dir: PathBuf,
    pub global_step: usize,
    pub metrics: TrainMetrics,
    /// Loss of the last evaluation pass, if evaluation ran.
    pub eval_loss: Option<f32>,
    pub dataset: DatasetStats,
    pub trainable_params: u64,
    pub all_params: u64,
    /// Samples dropped because their image failed.
    pub skipped_samples: usize,
    /// Micro-batches replaced by the placeholder batch.
    pub placeholder_batches: usize,
    /// Label positions that contributed to the loss.
    pub supervised_tokens: u64,
    /// Checkpoint directories still on disk at the end of the run.
    pub checkpoints: Vec<PathBuf>,
}

impl TrainingSummary {
    pub fn set_parameters(&mut self, counts: ParameterCounts) {
        self.trainable_params = counts.trainable;
        self.all_params = counts.all;
    }

    /// Final scalars for the tracker summary.
    pub fn scalars(&self) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("train/global_step".into(), self.global_step as f64);
        m.insert("train/train_loss".into(), f64::from(self.metrics.train_loss));
        m.insert("train/train_runtime".into(), self.metrics.train_runtime);
        m.insert("train/epoch".into(), self.metrics.epoch);
        m.insert("train/skipped_samples".into(), self.skipped_samples as f64);
        m.insert("train/placeholder_batches".into(), self.placeholder_batches as f64);
        if let Some(v) = self.eval_loss {
            m.insert("eval/loss".into(), f64::from(v));
        }
        m
    }

    /// Write `train_results.json` and `all_results.json` into `dir`.
    pub fn write_results(&self, dir: &Path) -> Result<(), TuneError> {
        write_json_atomic(&dir.join("train_results.json"), &self.metrics)?;

        let mut all = serde_json::to_value(&self.metrics)
            .map_err(|e| TuneError::Internal(format!("serialise metrics: {e}")))?;
        if let (Some(obj), Some(eval_loss)) = (all.as_object_mut(), self.eval_loss) {
            obj.insert("eval_loss".into(), serde_json::json!(eval_loss));
            obj.insert("eval_samples".into(), serde_json::json!(self.dataset.eval));
        }
        write_json_atomic(&dir.join("all_results.json"), &all)
    }
}

/// Serialise `value` as pretty JSON to `path`, replacing any existing file
/// only once the new content is fully written.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TuneError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| TuneError::write(dir, e))?;

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| TuneError::Internal(format!("serialise {}: {e}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| TuneError::write(dir, e))?;
    tmp.write_all(&json).map_err(|e| TuneError::write(path, e))?;
    tmp.persist(path).map_err(|e| TuneError::write(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> TrainingSummary {
        TrainingSummary {
            run_name: "r".into(),
            output_dir: "out".into(),
            global_step: 12,
            metrics: TrainMetrics {
                train_runtime: 2.0,
                train_samples_per_second: 48.0,
                train_steps_per_second: 6.0,
                train_loss: 0.5,
                epoch: 3.0,
            },
            eval_loss: Some(0.25),
            dataset: DatasetStats {
                source: "d.json".into(),
                total: 10,
                filtered: 8,
                train: 6,
                eval: 2,
            },
            trainable_params: 10,
            all_params: 100,
            skipped_samples: 1,
            placeholder_batches: 0,
            supervised_tokens: 99,
            checkpoints: vec![],
        }
    }

    #[test]
    fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["a"], 2);
        // no temp files left behind
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn results_files() {
        let dir = tempfile::tempdir().unwrap();
        summary().write_results(dir.path()).unwrap();
        let train: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("train_results.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(train["train_loss"], 0.5);
        assert!(train.get("eval_loss").is_none());
        let all: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("all_results.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(all["eval_loss"], 0.25);
        assert_eq!(all["eval_samples"], 2);
    }

    #[test]
    fn log_entry_metrics_only_present_fields() {
        let e = LogEntry {
            step: 10,
            epoch: 0.5,
            loss: Some(1.5),
            ..Default::default()
        };
        let m = e.metrics();
        assert_eq!(m.len(), 2);
        assert_eq!(m["train/loss"], 1.5);
    }
}
