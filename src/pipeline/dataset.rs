//! Dataset discovery, parsing, subset filtering and the train/eval split.
//!
//! The dataset is read from a local cache directory only. The first
//! `.json`/`.jsonl` file found (in sorted path order) is the source; a
//! `.json` file is one array of records, a `.jsonl` file holds one record
//! per line.
//!
//! Shuffling and splitting are driven by a seeded `StdRng`, so the same seed
//! always yields the same partitions.

use crate::config::TrainingConfig;
use crate::error::TuneError;
use crate::output::DatasetStats;
use crate::pipeline::messages::{normalize, Dialogue, Message, Sample, Turn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Training and evaluation partitions plus where they came from.
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    /// File the records were read from.
    pub source: PathBuf,
    /// Records in the file before filtering.
    pub total: usize,
    /// Records left after the subset filter.
    pub filtered: usize,
    pub train: Vec<Sample>,
    pub eval: Vec<Sample>,
}

impl DatasetSplit {
    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            source: self.source.clone(),
            total: self.total,
            filtered: self.filtered,
            train: self.train.len(),
            eval: self.eval.len(),
        }
    }
}

/// A record as it appears on disk. Every field is optional so that records
/// with zero turns (or a missing image key) still load.
#[derive(Deserialize)]
struct RawRecord {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    conversations: Option<Vec<Turn>>,
    #[serde(default)]
    messages: Option<Vec<Message>>,
}

impl From<RawRecord> for Sample {
    fn from(raw: RawRecord) -> Self {
        let id = raw.id.map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        let dialogue = match (raw.messages, raw.conversations) {
            (Some(messages), _) => Dialogue::Messages(messages),
            (None, turns) => Dialogue::Conversations(turns.unwrap_or_default()),
        };
        Sample {
            id,
            image: raw.image,
            dialogue,
        }
    }
}

/// Find the dataset file under `cache_dir`.
///
/// Walks the directory recursively and returns the first `.json` or
/// `.jsonl` file in sorted path order.
pub fn discover_dataset_file(cache_dir: &Path) -> Result<PathBuf, TuneError> {
    if !cache_dir.is_dir() {
        return Err(TuneError::DatasetNotFound {
            dir: cache_dir.to_path_buf(),
        });
    }

    let mut candidates: Vec<PathBuf> = WalkDir::new(cache_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json") | Some("jsonl")
            )
        })
        .collect();
    candidates.sort();

    if candidates.len() > 1 {
        debug!(
            "{} dataset candidates under {}, using the first",
            candidates.len(),
            cache_dir.display()
        );
    }

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| TuneError::DatasetNotFound {
            dir: cache_dir.to_path_buf(),
        })
}

/// Parse every record in a `.json` (array) or `.jsonl` (line-delimited) file.
pub fn load_samples(path: &Path) -> Result<Vec<Sample>, TuneError> {
    let file = std::fs::File::open(path).map_err(|source| TuneError::DatasetUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    let is_jsonl = path.extension().and_then(|e| e.to_str()) == Some("jsonl");
    if !is_jsonl {
        let records: Vec<RawRecord> =
            serde_json::from_reader(reader).map_err(|e| TuneError::DatasetParse {
                path: path.to_path_buf(),
                line: None,
                detail: e.to_string(),
            })?;
        return Ok(records.into_iter().map(Sample::from).collect());
    }

    let mut samples = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| TuneError::DatasetUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RawRecord =
            serde_json::from_str(&line).map_err(|e| TuneError::DatasetParse {
                path: path.to_path_buf(),
                line: Some(i + 1),
                detail: e.to_string(),
            })?;
        samples.push(Sample::from(record));
    }
    Ok(samples)
}

/// Keep samples whose image path contains `marker`, ignoring case.
///
/// Filtering twice with the same marker returns the same set.
pub fn filter_subset(samples: Vec<Sample>, marker: &str) -> Vec<Sample> {
    let marker = marker.to_lowercase();
    samples
        .into_iter()
        .filter(|s| s.image.to_lowercase().contains(&marker))
        .collect()
}

/// Deterministically permute `samples` with a `StdRng` seeded from `seed`.
pub fn shuffle(mut samples: Vec<Sample>, seed: u64) -> Vec<Sample> {
    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);
    samples
}

/// Split into `(train, eval)`.
///
/// The samples are permuted with `seed`; the first `eval_samples` become the
/// evaluation partition and the rest train. `eval_samples == 0` leaves the
/// evaluation partition empty.
pub fn split(
    samples: Vec<Sample>,
    eval_samples: usize,
    seed: u64,
) -> Result<(Vec<Sample>, Vec<Sample>), TuneError> {
    if eval_samples > 0 && eval_samples >= samples.len() {
        return Err(TuneError::SplitTooSmall {
            available: samples.len(),
            requested: eval_samples,
        });
    }
    let mut permuted = shuffle(samples, seed);
    let train = permuted.split_off(eval_samples);
    Ok((train, permuted))
}

/// Run discovery, parsing, filtering, shuffling and splitting for `config`.
pub fn prepare_dataset(config: &TrainingConfig) -> Result<DatasetSplit, TuneError> {
    let source = discover_dataset_file(&config.dataset_cache_dir)?;
    info!("Loading dataset from {}", source.display());

    let samples = load_samples(&source)?;
    let total = samples.len();
    info!("Total dataset size: {}", total);

    let filtered = filter_subset(samples, &config.dataset_subset);
    info!(
        "Samples matching subset '{}': {}",
        config.dataset_subset,
        filtered.len()
    );
    if filtered.is_empty() {
        return Err(TuneError::EmptyDataset {
            marker: config.dataset_subset.clone(),
            total,
        });
    }
    let filtered_count = filtered.len();

    let mut shuffled = shuffle(filtered, config.seed);
    if let Some(train_cap) = config.train_samples {
        shuffled.truncate(train_cap.saturating_add(config.eval_samples));
    }

    let (mut train, eval) = split(shuffled, config.eval_samples, config.seed)?;
    if let Some(train_cap) = config.train_samples {
        train.truncate(train_cap);
    }
    if train.is_empty() {
        warn!("Training partition is empty; no optimizer steps will run");
    }

    info!("Training samples: {}", train.len());
    info!("Evaluation samples: {}", eval.len());

    Ok(DatasetSplit {
        source,
        total,
        filtered: filtered_count,
        train,
        eval,
    })
}

/// Write both partitions as JSONL with normalized messages.
///
/// Produces `train.jsonl` and `eval.jsonl` in `dir` and returns their paths.
pub fn export_split(split: &DatasetSplit, dir: &Path) -> Result<(PathBuf, PathBuf), TuneError> {
    std::fs::create_dir_all(dir).map_err(|e| TuneError::write(dir, e))?;
    let train_path = dir.join("train.jsonl");
    let eval_path = dir.join("eval.jsonl");
    write_jsonl(&split.train, &train_path)?;
    write_jsonl(&split.eval, &eval_path)?;
    info!(
        "Exported {} train / {} eval samples to {}",
        split.train.len(),
        split.eval.len(),
        dir.display()
    );
    Ok((train_path, eval_path))
}

fn write_jsonl(samples: &[Sample], path: &Path) -> Result<(), TuneError> {
    let file = std::fs::File::create(path).map_err(|e| TuneError::write(path, e))?;
    let mut writer = BufWriter::new(file);
    for sample in samples {
        let normalized = Sample {
            id: sample.id.clone(),
            image: sample.image.clone(),
            dialogue: Dialogue::Messages(normalize(sample)),
        };
        let line = serde_json::to_string(&normalized)
            .map_err(|e| TuneError::Internal(format!("serialise sample: {e}")))?;
        writeln!(writer, "{line}").map_err(|e| TuneError::write(path, e))?;
    }
    writer.flush().map_err(|e| TuneError::write(path, e))
}
