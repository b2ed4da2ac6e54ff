//! Configuration types for a fine-tuning run.
//!
//! Every knob of a run lives in [`TrainingConfig`], built via its
//! [`TrainingConfigBuilder`] and frozen for the rest of the process. Every
//! downstream component (dataset loader, processor, LoRA attachment, driver,
//! tracker) only ever reads it.
//!
//! The one derived field is the run name: when none is supplied, `build()`
//! stamps `<run_name_prefix>-YYYYmmdd-HHMMSS` from the local clock.

use crate::args::LrSchedulerType;
use crate::error::TuneError;
use crate::lora::TargetModules;
use crate::model::Precision;
use crate::pipeline::template::ChatTemplate;
use crate::progress::ProgressCallback;
use crate::tracking::TrackingMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Configuration for one fine-tuning run.
///
/// Built via [`TrainingConfig::builder()`], loaded with
/// [`TrainingConfig::from_json_file`], or using [`TrainingConfig::default()`]
/// (which leaves the run name unset until built).
///
/// # Example
/// ```rust
/// use vlm_sft::TrainingConfig;
///
/// let config = TrainingConfig::builder()
///     .dataset_subset("ptb-xl")
///     .lora_r(16)
///     .learning_rate(2e-5)
///     .build()
///     .unwrap();
/// assert!(config.run_name().starts_with("medgemma-ecg-"));
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // ── Model ────────────────────────────────────────────────────────────
    /// Local directory holding the pretrained weights and processor files.
    pub model_id: PathBuf,

    /// Directory receiving checkpoints, the final adapter and metrics.
    pub output_dir: PathBuf,

    /// Numeric format the base model is loaded in. Default: bf16.
    pub precision: Precision,

    // ── Dataset ──────────────────────────────────────────────────────────
    /// Human-readable dataset name, recorded in tracking only.
    pub dataset_name: String,

    /// Subset marker: only samples whose image path contains this
    /// (case-insensitively) are kept. Default: `ptb-xl`.
    pub dataset_subset: String,

    /// Directory searched (recursively) for the dataset JSON file.
    pub dataset_cache_dir: PathBuf,

    /// Root that relative image paths are resolved against.
    pub image_folder: PathBuf,

    /// Cap on training samples. `None` uses everything left after the split.
    pub train_samples: Option<usize>,

    /// Size of the held-out evaluation partition. Default: 2000.
    pub eval_samples: usize,

    /// Seed for the dataset shuffle, the split and per-epoch ordering.
    pub seed: u64,

    // ── Processor ────────────────────────────────────────────────────────
    /// Maximum tokens per sequence; longer sequences are truncated. Default: 2048.
    pub max_seq_length: usize,

    /// Chat format the model was trained on. Default: Gemma.
    pub chat_template: ChatTemplate,

    /// Token strings masked out of the labels in addition to padding and the
    /// image placeholder, resolved through the tokenizer at load time.
    ///
    /// Default: `["<image_soft_token>"]`. Tokens absent from the vocabulary
    /// are skipped with a warning.
    pub reserved_tokens: Vec<String>,

    /// Raw token ids masked out of the labels, for vocabularies where the
    /// reserved token has no stable string form.
    pub reserved_token_ids: Vec<u32>,

    // ── LoRA ─────────────────────────────────────────────────────────────
    /// Adapter rank. Default: 32.
    pub lora_r: usize,

    /// Adapter scaling numerator (`alpha / r`). Default: 64.
    pub lora_alpha: u32,

    /// Dropout applied on the adapter path. Default: 0.05.
    pub lora_dropout: f32,

    /// Which linear modules receive an adapter. Default: all-linear.
    pub target_modules: TargetModules,

    // ── Hyperparameters ──────────────────────────────────────────────────
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,

    /// Micro-batches accumulated before each optimizer step. Default: 8.
    pub gradient_accumulation_steps: usize,

    pub learning_rate: f64,
    pub max_grad_norm: f64,

    /// Fraction of total optimizer steps spent in linear warmup. Default: 0.1.
    pub warmup_ratio: f64,

    pub weight_decay: f64,

    /// Optimizer name handed to the executor. Default: `adamw_torch_fused`.
    pub optim: String,

    pub lr_scheduler_type: LrSchedulerType,

    /// Hard cap on optimizer steps, overriding the epoch count when smaller.
    pub max_steps: Option<usize>,

    // ── Logging, evaluation, checkpoints ─────────────────────────────────
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub save_steps: usize,

    /// Number of `checkpoint-*` directories kept. `None` keeps all. Default: 3.
    pub save_total_limit: Option<usize>,

    // ── Experiment tracking ──────────────────────────────────────────────
    pub tracking: TrackingMode,

    /// Local directory the offline tracker writes into.
    pub tracking_dir: PathBuf,

    pub tracking_project: String,

    /// Run name. Filled from `run_name_prefix` and a timestamp by `build()`.
    pub run_name: Option<String>,

    pub run_name_prefix: String,

    // ── System ───────────────────────────────────────────────────────────
    pub bf16: bool,
    pub tf32: bool,
    pub gradient_checkpointing: bool,

    /// Batches collated ahead of the step on the blocking pool. Default: 8.
    pub dataloader_num_workers: usize,

    /// DeepSpeed config forwarded to the executor untouched.
    pub deepspeed: Option<PathBuf>,

    /// Optional progress callback. Never serialised.
    #[serde(skip)]
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_id: PathBuf::from("./models/medgemma-4b-it"),
            output_dir: PathBuf::from("medgemma-4b-ecginstruct-lora"),
            precision: Precision::default(),
            dataset_name: "PULSE-ECG/ECGInstruct".to_string(),
            dataset_subset: "ptb-xl".to_string(),
            dataset_cache_dir: PathBuf::from("./ecg_dataset_cache"),
            image_folder: PathBuf::from("./ecg_images"),
            train_samples: None,
            eval_samples: 2000,
            seed: 42,
            max_seq_length: 2048,
            chat_template: ChatTemplate::default(),
            reserved_tokens: vec!["<image_soft_token>".to_string()],
            reserved_token_ids: Vec::new(),
            lora_r: 32,
            lora_alpha: 64,
            lora_dropout: 0.05,
            target_modules: TargetModules::default(),
            num_train_epochs: 3,
            per_device_train_batch_size: 4,
            per_device_eval_batch_size: 4,
            gradient_accumulation_steps: 8,
            learning_rate: 1.2e-5,
            max_grad_norm: 1.0,
            warmup_ratio: 0.1,
            weight_decay: 0.005,
            optim: "adamw_torch_fused".to_string(),
            lr_scheduler_type: LrSchedulerType::default(),
            max_steps: None,
            logging_steps: 10,
            eval_steps: 100,
            save_steps: 1000,
            save_total_limit: Some(3),
            tracking: TrackingMode::default(),
            tracking_dir: PathBuf::from("./wandb"),
            tracking_project: "medgemma-ecginstruct".to_string(),
            run_name: None,
            run_name_prefix: "medgemma-ecg".to_string(),
            bf16: true,
            tf32: true,
            gradient_checkpointing: true,
            dataloader_num_workers: 8,
            deepspeed: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for TrainingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingConfig")
            .field("model_id", &self.model_id)
            .field("output_dir", &self.output_dir)
            .field("precision", &self.precision)
            .field("dataset_subset", &self.dataset_subset)
            .field("dataset_cache_dir", &self.dataset_cache_dir)
            .field("image_folder", &self.image_folder)
            .field("train_samples", &self.train_samples)
            .field("eval_samples", &self.eval_samples)
            .field("seed", &self.seed)
            .field("lora_r", &self.lora_r)
            .field("lora_alpha", &self.lora_alpha)
            .field("target_modules", &self.target_modules)
            .field("num_train_epochs", &self.num_train_epochs)
            .field("learning_rate", &self.learning_rate)
            .field("run_name", &self.run_name)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn TrainingProgressCallback>"),
            )
            .finish()
    }
}

impl TrainingConfig {
    /// Create a new builder for `TrainingConfig`.
    pub fn builder() -> TrainingConfigBuilder {
        TrainingConfigBuilder {
            config: Self::default(),
        }
    }

    /// Start a builder from a JSON config file.
    ///
    /// Missing keys take their defaults, so a file may set only a few fields.
    /// The returned builder still has to be built, which validates the result
    /// and stamps the run name.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<TrainingConfigBuilder, TuneError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TuneError::InvalidConfig(format!("cannot read '{}': {}", path.display(), e))
        })?;
        let config: TrainingConfig = serde_json::from_str(&text).map_err(|e| {
            TuneError::InvalidConfig(format!("cannot parse '{}': {}", path.display(), e))
        })?;
        Ok(TrainingConfigBuilder { config })
    }

    /// The run name, derived at build time when none was supplied.
    pub fn run_name(&self) -> &str {
        self.run_name.as_deref().unwrap_or(&self.run_name_prefix)
    }
}

/// `<prefix>-YYYYmmdd-HHMMSS` for the given instant.
pub fn stamped_run_name<Tz: chrono::TimeZone>(prefix: &str, now: &chrono::DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    format!("{}-{}", prefix, now.format("%Y%m%d-%H%M%S"))
}

/// Builder for [`TrainingConfig`].
#[derive(Debug)]
pub struct TrainingConfigBuilder {
    config: TrainingConfig,
}

impl TrainingConfigBuilder {
    pub fn model_id(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_id = path.into();
        self
    }

    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output_dir = path.into();
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.config.precision = precision;
        self
    }

    pub fn dataset_name(mut self, name: impl Into<String>) -> Self {
        self.config.dataset_name = name.into();
        self
    }

    pub fn dataset_subset(mut self, marker: impl Into<String>) -> Self {
        self.config.dataset_subset = marker.into();
        self
    }

    pub fn dataset_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dataset_cache_dir = path.into();
        self
    }

    pub fn image_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.image_folder = path.into();
        self
    }

    pub fn train_samples(mut self, n: Option<usize>) -> Self {
        self.config.train_samples = n;
        self
    }

    pub fn eval_samples(mut self, n: usize) -> Self {
        self.config.eval_samples = n;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn max_seq_length(mut self, n: usize) -> Self {
        self.config.max_seq_length = n.max(16);
        self
    }

    pub fn chat_template(mut self, template: ChatTemplate) -> Self {
        self.config.chat_template = template;
        self
    }

    pub fn reserved_tokens(mut self, tokens: Vec<String>) -> Self {
        self.config.reserved_tokens = tokens;
        self
    }

    pub fn reserved_token_ids(mut self, ids: Vec<u32>) -> Self {
        self.config.reserved_token_ids = ids;
        self
    }

    pub fn lora_r(mut self, r: usize) -> Self {
        self.config.lora_r = r.max(1);
        self
    }

    pub fn lora_alpha(mut self, alpha: u32) -> Self {
        self.config.lora_alpha = alpha;
        self
    }

    pub fn lora_dropout(mut self, p: f32) -> Self {
        self.config.lora_dropout = p.clamp(0.0, 0.99);
        self
    }

    pub fn target_modules(mut self, targets: TargetModules) -> Self {
        self.config.target_modules = targets;
        self
    }

    pub fn num_train_epochs(mut self, n: usize) -> Self {
        self.config.num_train_epochs = n;
        self
    }

    pub fn per_device_train_batch_size(mut self, n: usize) -> Self {
        self.config.per_device_train_batch_size = n.max(1);
        self
    }

    pub fn per_device_eval_batch_size(mut self, n: usize) -> Self {
        self.config.per_device_eval_batch_size = n.max(1);
        self
    }

    pub fn gradient_accumulation_steps(mut self, n: usize) -> Self {
        self.config.gradient_accumulation_steps = n.max(1);
        self
    }

    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.config.learning_rate = lr;
        self
    }

    pub fn max_grad_norm(mut self, norm: f64) -> Self {
        self.config.max_grad_norm = norm;
        self
    }

    pub fn warmup_ratio(mut self, ratio: f64) -> Self {
        self.config.warmup_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn weight_decay(mut self, wd: f64) -> Self {
        self.config.weight_decay = wd;
        self
    }

    pub fn optim(mut self, name: impl Into<String>) -> Self {
        self.config.optim = name.into();
        self
    }

    pub fn lr_scheduler_type(mut self, kind: LrSchedulerType) -> Self {
        self.config.lr_scheduler_type = kind;
        self
    }

    pub fn max_steps(mut self, n: Option<usize>) -> Self {
        self.config.max_steps = n;
        self
    }

    pub fn logging_steps(mut self, n: usize) -> Self {
        self.config.logging_steps = n.max(1);
        self
    }

    pub fn eval_steps(mut self, n: usize) -> Self {
        self.config.eval_steps = n.max(1);
        self
    }

    pub fn save_steps(mut self, n: usize) -> Self {
        self.config.save_steps = n.max(1);
        self
    }

    pub fn save_total_limit(mut self, n: Option<usize>) -> Self {
        self.config.save_total_limit = n.map(|n| n.max(1));
        self
    }

    pub fn tracking(mut self, mode: TrackingMode) -> Self {
        self.config.tracking = mode;
        self
    }

    pub fn tracking_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tracking_dir = path.into();
        self
    }

    pub fn tracking_project(mut self, project: impl Into<String>) -> Self {
        self.config.tracking_project = project.into();
        self
    }

    pub fn run_name(mut self, name: impl Into<String>) -> Self {
        self.config.run_name = Some(name.into());
        self
    }

    pub fn run_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.run_name_prefix = prefix.into();
        self
    }

    pub fn bf16(mut self, v: bool) -> Self {
        self.config.bf16 = v;
        self
    }

    pub fn tf32(mut self, v: bool) -> Self {
        self.config.tf32 = v;
        self
    }

    pub fn gradient_checkpointing(mut self, v: bool) -> Self {
        self.config.gradient_checkpointing = v;
        self
    }

    pub fn dataloader_num_workers(mut self, n: usize) -> Self {
        self.config.dataloader_num_workers = n;
        self
    }

    pub fn deepspeed(mut self, path: Option<PathBuf>) -> Self {
        self.config.deepspeed = path;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints and stamping the run name.
    pub fn build(mut self) -> Result<TrainingConfig, TuneError> {
        let c = &self.config;
        if !(c.learning_rate.is_finite() && c.learning_rate > 0.0) {
            return Err(TuneError::InvalidConfig(format!(
                "learning rate must be a positive number, got {}",
                c.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&c.warmup_ratio) {
            return Err(TuneError::InvalidConfig(format!(
                "warmup ratio must be 0–1, got {}",
                c.warmup_ratio
            )));
        }
        if !(0.0..1.0).contains(&c.lora_dropout) {
            return Err(TuneError::InvalidConfig(format!(
                "LoRA dropout must be in [0, 1), got {}",
                c.lora_dropout
            )));
        }
        if c.lora_r == 0 {
            return Err(TuneError::InvalidConfig("LoRA rank must be ≥ 1".into()));
        }
        if c.per_device_train_batch_size == 0
            || c.per_device_eval_batch_size == 0
            || c.gradient_accumulation_steps == 0
        {
            return Err(TuneError::InvalidConfig(
                "batch sizes and gradient accumulation must be ≥ 1".into(),
            ));
        }
        if c.logging_steps == 0 || c.eval_steps == 0 || c.save_steps == 0 {
            return Err(TuneError::InvalidConfig(
                "logging, eval and save cadence must be ≥ 1 step".into(),
            ));
        }
        if c.save_total_limit == Some(0) {
            return Err(TuneError::InvalidConfig(
                "save_total_limit must be ≥ 1 or unset".into(),
            ));
        }
        if c.num_train_epochs == 0 && c.max_steps.is_none() {
            return Err(TuneError::InvalidConfig(
                "num_train_epochs is 0 and no max_steps given; nothing to train".into(),
            ));
        }
        if let TargetModules::Pattern(ref p) = c.target_modules {
            regex::Regex::new(p).map_err(|e| {
                TuneError::InvalidConfig(format!("target module pattern '{}': {}", p, e))
            })?;
        }

        if self.config.run_name.is_none() {
            self.config.run_name = Some(stamped_run_name(
                &self.config.run_name_prefix,
                &chrono::Local::now(),
            ));
        }
        Ok(self.config)
    }
}
