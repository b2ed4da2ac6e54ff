//! Error types for the vlm-sft library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`TuneError`] is **fatal**: the run cannot proceed at all (dataset
//!   missing, every record filtered out, model or processor failed to load).
//!   Returned as `Err(TuneError)` from the setup stages and from
//!   [`crate::train::train`]. There is no retry.
//!
//! * [`SampleError`] is **non-fatal**: one sample's image could not be read
//!   or did not fit its dialogue while a batch was being assembled. The
//!   sample is dropped, the error is logged and recorded on
//!   [`crate::pipeline::collate::Batch::skipped`], and training continues.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the vlm-sft library.
///
/// Per-sample image failures use [`SampleError`] and never surface here.
#[derive(Debug, Error)]
pub enum TuneError {
    // ── Dataset errors ────────────────────────────────────────────────────
    /// No dataset file under the configured cache directory.
    #[error(
        "No JSON dataset found under '{dir}'\n\
Download the dataset into the cache directory first (one .json or .jsonl file)."
    )]
    DatasetNotFound { dir: PathBuf },

    /// The dataset file exists but could not be read.
    #[error("Failed to read dataset '{path}': {source}")]
    DatasetUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record in the dataset is not valid JSON or has the wrong shape.
    #[error("Failed to parse dataset '{path}'{}: {detail}", .line.map(|l| format!(" at line {l}")).unwrap_or_default())]
    DatasetParse {
        path: PathBuf,
        line: Option<usize>,
        detail: String,
    },

    /// Every record was removed by the subset filter.
    #[error("No samples matching subset marker '{marker}' (dataset had {total} records)")]
    EmptyDataset { marker: String, total: usize },

    /// The evaluation partition would consume the whole dataset.
    #[error("Cannot split {available} samples with {requested} held out for evaluation\nLower --eval-samples.")]
    SplitTooSmall { available: usize, requested: usize },

    // ── Model / processor errors ──────────────────────────────────────────
    /// Pretrained weights or model config could not be loaded.
    #[error("Failed to load model from '{path}': {detail}")]
    ModelLoadFailed { path: PathBuf, detail: String },

    /// Tokenizer or processor configuration could not be loaded.
    #[error("Failed to load processor from '{path}': {detail}")]
    ProcessorLoadFailed { path: PathBuf, detail: String },

    /// A special token required by the processor is absent from the vocabulary.
    #[error("Special token '{token}' is not in the tokenizer vocabulary")]
    MissingSpecialToken { token: String },

    /// The tokenizer rejected an input text.
    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    /// An image reached preprocessing at a size the processor cannot emit.
    #[error("Image preprocessing failed: {0}")]
    ImageProcessing(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or file validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Training errors ───────────────────────────────────────────────────
    /// The step executor (external training framework) reported a failure.
    #[error("Step executor failed at step {step}: {detail}")]
    Executor { step: usize, detail: String },

    /// The experiment tracker could not record the run.
    #[error("Experiment tracking failed: {0}")]
    Tracking(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output artifact.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TuneError {
    /// Shorthand for wrapping an I/O failure on an output path.
    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TuneError::OutputWriteFailed {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal error for a single sample.
///
/// Recorded on the batch the sample was dropped from. The batch is still
/// built from the remaining samples, or from a placeholder if none remain.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum SampleError {
    /// The resolved image path does not exist.
    #[error("Sample {index}: image not found: '{path}'")]
    ImageNotFound { index: usize, path: PathBuf },

    /// The file exists but could not be opened or decoded.
    #[error("Sample {index}: cannot load image '{path}': {detail}")]
    ImageUnreadable {
        index: usize,
        path: PathBuf,
        detail: String,
    },

    /// Resizing is disabled and the image is not the processor's input size.
    #[error(
        "Sample {index}: image '{path}' is {width}x{height}, expected {expected_width}x{expected_height} with resizing disabled"
    )]
    ImageSizeMismatch {
        index: usize,
        path: PathBuf,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    /// The normalized dialogue does not carry exactly one image marker, so
    /// its image would have no tokens to attach to.
    #[error("Sample {index}: dialogue has {markers} image markers, expected 1")]
    ImageMarkerMismatch { index: usize, markers: usize },
}

impl SampleError {
    /// Position of the failing sample within its batch.
    pub fn index(&self) -> usize {
        match self {
            SampleError::ImageNotFound { index, .. }
            | SampleError::ImageUnreadable { index, .. }
            | SampleError::ImageSizeMismatch { index, .. }
            | SampleError::ImageMarkerMismatch { index, .. } => *index,
        }
    }
}
