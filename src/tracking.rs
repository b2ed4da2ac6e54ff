//! Experiment tracking.
//!
//! The offline tracker keeps a run entirely on local disk:
//!
//! ```text
//! <tracking_dir>/<project>/<run_name>/
//!     config.json     run configuration, written at init
//!     metrics.jsonl   one line per logged step
//!     summary.json    final scalars, written at finish
//! ```
//!
//! Nothing is sent over the network.

use crate::error::TuneError;
use crate::output::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where tracked metrics go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// Write to `tracking_dir` on local disk.
    #[default]
    Offline,
    Disabled,
}

/// The run parameters recorded when tracking starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model_id: PathBuf,
    pub dataset: String,
    pub lora_r: usize,
    pub lora_alpha: u32,
    pub learning_rate: f64,
    /// Per-device batch × accumulation × devices.
    pub batch_size: usize,
    pub num_epochs: usize,
}

/// Receives metrics as training runs.
pub trait ExperimentTracker: Send {
    fn log(&mut self, step: usize, metrics: &BTreeMap<String, f64>) -> Result<(), TuneError>;

    /// Record final scalars and close the run.
    fn finish(&mut self, summary: &BTreeMap<String, f64>) -> Result<(), TuneError>;
}

/// Discards everything.
pub struct NoopTracker;

impl ExperimentTracker for NoopTracker {
    fn log(&mut self, _step: usize, _metrics: &BTreeMap<String, f64>) -> Result<(), TuneError> {
        Ok(())
    }

    fn finish(&mut self, _summary: &BTreeMap<String, f64>) -> Result<(), TuneError> {
        Ok(())
    }
}

/// Writes a run to a local directory.
pub struct OfflineTracker {
    run_dir: PathBuf,
    metrics: BufWriter<std::fs::File>,
}

impl OfflineTracker {
    /// Create `<dir>/<project>/<run_name>/` and record the run config.
    pub fn init(
        dir: &Path,
        project: &str,
        run_name: &str,
        run_config: &RunConfig,
    ) -> Result<Self, TuneError> {
        let run_dir = dir.join(project).join(run_name);
        std::fs::create_dir_all(&run_dir).map_err(|e| tracking_failed(&run_dir, e))?;
        write_json_atomic(&run_dir.join("config.json"), run_config)?;

        let metrics_path = run_dir.join("metrics.jsonl");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&metrics_path)
            .map_err(|e| tracking_failed(&metrics_path, e))?;

        info!("Tracking run '{}' offline in {}", run_name, run_dir.display());
        Ok(Self {
            run_dir,
            metrics: BufWriter::new(file),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

fn tracking_failed(path: &Path, e: impl std::fmt::Display) -> TuneError {
    TuneError::Tracking(format!("{}: {}", path.display(), e))
}

impl ExperimentTracker for OfflineTracker {
    fn log(&mut self, step: usize, metrics: &BTreeMap<String, f64>) -> Result<(), TuneError> {
        let mut row = serde_json::Map::new();
        row.insert("_step".into(), serde_json::json!(step));
        row.insert(
            "_timestamp".into(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
        for (k, v) in metrics {
            row.insert(k.clone(), serde_json::json!(v));
        }
        let line = serde_json::to_string(&row).map_err(|e| TuneError::Tracking(e.to_string()))?;
        writeln!(self.metrics, "{line}").map_err(|e| tracking_failed(&self.run_dir, e))?;
        // Flushed per row so a crashed run keeps everything logged so far.
        self.metrics
            .flush()
            .map_err(|e| tracking_failed(&self.run_dir, e))?;
        debug!("tracked step {} ({} metrics)", step, metrics.len());
        Ok(())
    }

    fn finish(&mut self, summary: &BTreeMap<String, f64>) -> Result<(), TuneError> {
        self.metrics
            .flush()
            .map_err(|e| tracking_failed(&self.run_dir, e))?;
        write_json_atomic(&self.run_dir.join("summary.json"), summary)?;
        info!("Tracking finished: {}", self.run_dir.display());
        Ok(())
    }
}

/// Start tracking for `mode`.
pub fn init_tracker(
    mode: TrackingMode,
    dir: &Path,
    project: &str,
    run_name: &str,
    run_config: &RunConfig,
) -> Result<Box<dyn ExperimentTracker>, TuneError> {
    match mode {
        TrackingMode::Offline => Ok(Box::new(OfflineTracker::init(
            dir, project, run_name, run_config,
        )?)),
        TrackingMode::Disabled => {
            debug!("Experiment tracking disabled");
            Ok(Box::new(NoopTracker))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config() -> RunConfig {
        RunConfig {
            model_id: "./models/medgemma-4b-it".into(),
            dataset: "PULSE-ECG/ECGInstruct".into(),
            lora_r: 32,
            lora_alpha: 64,
            learning_rate: 1.2e-5,
            batch_size: 32,
            num_epochs: 3,
        }
    }

    #[test]
    fn offline_tracker_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = OfflineTracker::init(dir.path(), "proj", "run-1", &run_config()).unwrap();
        let run_dir = dir.path().join("proj/run-1");
        assert_eq!(t.run_dir(), run_dir.as_path());

        let mut m = BTreeMap::new();
        m.insert("train/loss".to_string(), 1.25);
        t.log(10, &m).unwrap();
        m.insert("train/loss".to_string(), 1.0);
        t.log(20, &m).unwrap();
        t.finish(&BTreeMap::from([("train/global_step".to_string(), 20.0)])).unwrap();

        let config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("config.json")).unwrap()).unwrap();
        assert_eq!(config["lora_r"], 32);

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(run_dir.join("metrics.jsonl"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["_step"], 20);
        assert_eq!(lines[1]["train/loss"], 1.0);

        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("summary.json")).unwrap()).unwrap();
        assert_eq!(summary["train/global_step"], 20.0);
    }

    #[test]
    fn disabled_mode_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = init_tracker(TrackingMode::Disabled, dir.path(), "p", "r", &run_config()).unwrap();
        t.log(1, &BTreeMap::new()).unwrap();
        t.finish(&BTreeMap::new()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
