//! # vlm-sft
//!
//! Supervised LoRA fine-tuning of image + text instruction models on local
//! instruction datasets.
//!
//! The crate owns the data side of a fine-tuning run: finding and filtering
//! the dataset, normalizing dialogues, rendering chat text, tokenizing,
//! loading images, masking labels, planning steps and writing checkpoints
//! and metrics. Forward/backward passes are delegated to a
//! [`StepExecutor`], so any numerical backend can drive the same pipeline.
//!
//! ## Pipeline Overview
//!
//! ```text
//! dataset cache
//!  │
//!  ├─ 1. Load      discover JSON/JSONL, parse records
//!  ├─ 2. Filter    keep the subset whose image path contains the marker
//!  ├─ 3. Split     seeded shuffle, held-out evaluation partition
//!  ├─ 4. Model     index weights, attach LoRA adapters, load processor
//!  ├─ 5. Collate   images + chat text → ids, pixels, masked labels
//!  │               (blocking pool, prefetched in order)
//!  ├─ 6. Step      executor forward/backward + optimizer step
//!  └─ 7. Output    checkpoints, adapter, metrics, tracking
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vlm_sft::{train, DryRunExecutor, TrainingConfig};
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TrainingConfig::builder()
//!         .model_id("./models/medgemma-4b-it")
//!         .dataset_cache_dir("./ecg_dataset_cache")
//!         .image_folder("./ecg_images")
//!         .build()?;
//!     let mut executor = DryRunExecutor::new();
//!     let summary = train(&config, &mut executor).await?;
//!     eprintln!("{} steps, {} samples skipped", summary.global_step, summary.skipped_samples);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `vlm-sft` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! vlm-sft = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod args;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod lora;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod tracking;
pub mod train;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use args::{LrSchedulerType, StepPlan, TrainingArguments};
pub use config::{TrainingConfig, TrainingConfigBuilder};
pub use error::{SampleError, TuneError};
pub use executor::{DryRunExecutor, ExecutorError, StepExecutor};
pub use lora::{attach_lora, AdaptedModel, LoraConfig, TargetModules};
pub use model::{check_accelerator, AcceleratorInfo, PretrainedModel, Precision};
pub use output::{DatasetStats, TrainMetrics, TrainingSummary};
pub use pipeline::collate::{Batch, BatchKind, Collator, IGNORE_INDEX};
pub use pipeline::dataset::{prepare_dataset, DatasetSplit};
pub use pipeline::messages::{normalize, ContentPart, Message, Role, Sample};
pub use pipeline::processor::{Processor, ProcessorOptions};
pub use pipeline::template::ChatTemplate;
pub use progress::{NoopProgressCallback, ProgressCallback, TrainingProgressCallback};
pub use tracking::TrackingMode;
pub use train::{inspect, prepare, train, train_sync};
