//! CLI binary for vlm-sft.
//!
//! A thin shim over the library crate that maps CLI flags (and an optional
//! JSON config file) to `TrainingConfig`, runs the pipeline and prints
//! results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vlm_sft::{
    inspect, prepare, train, AcceleratorInfo, ChatTemplate, DryRunExecutor, LrSchedulerType,
    Precision, ProgressCallback, TargetModules, TrackingMode, TrainingConfig,
    TrainingProgressCallback,
};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live step bar plus log lines for
/// evaluations, checkpoints and skipped samples.
struct CliProgressCallback {
    bar: ProgressBar,
    skipped: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_train_start` reports the step count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading dataset and model…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            skipped: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>5}/{len} steps  {msg}  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Training");
        self.bar.set_message("");
        self.bar.reset_eta();
    }
}

impl TrainingProgressCallback for CliProgressCallback {
    fn on_train_start(&self, total_steps: usize, train_samples: usize) {
        self.activate_bar(total_steps);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "Training {total_steps} steps over {train_samples} samples…"
            ))
        ));
    }

    fn on_step(&self, step: usize, _total_steps: usize, loss: f32, learning_rate: f64) {
        self.bar.set_position(step as u64);
        self.bar
            .set_message(format!("loss {loss:.4}  lr {learning_rate:.2e}"));
    }

    fn on_eval(&self, step: usize, eval_loss: f32) {
        self.bar.println(format!(
            "  {} eval  step {:>5}  {}",
            cyan("◇"),
            step,
            bold(&format!("loss {eval_loss:.4}"))
        ));
    }

    fn on_checkpoint(&self, step: usize, path: &Path) {
        self.bar.println(format!(
            "  {} checkpoint  step {:>5}  {}",
            green("✓"),
            step,
            dim(&path.display().to_string())
        ));
    }

    fn on_sample_skipped(&self, error: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);

        // Truncate very long error messages to keep output tidy.
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!("  {} {}", red("✗"), dim(&msg)));
    }

    fn on_train_complete(&self, global_step: usize, train_loss: f32) {
        self.bar.finish_and_clear();
        let skipped = self.skipped.load(Ordering::SeqCst);
        if skipped == 0 {
            eprintln!(
                "{} {} steps, train loss {:.4}",
                green("✔"),
                bold(&global_step.to_string()),
                train_loss
            );
        } else {
            eprintln!(
                "{} {} steps, train loss {:.4}  ({} samples skipped)",
                cyan("⚠"),
                bold(&global_step.to_string()),
                train_loss,
                red(&skipped.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full run with the default layout
  vlm-sft --model ./models/medgemma-4b-it \
          --dataset-cache ./ecg_dataset_cache --image-folder ./ecg_images

  # Start from a JSON config file, override a few fields
  vlm-sft --config run.json --learning-rate 2e-5 --run-name lr-sweep-2

  # Check the dataset without loading the model
  vlm-sft --inspect-only --dataset-cache ./ecg_dataset_cache

  # Write the normalized train/eval partitions as JSONL
  vlm-sft --prepare-only ./prepared --dataset-cache ./ecg_dataset_cache

  # Short smoke run: 20 steps, evaluate and checkpoint every 10
  vlm-sft --max-steps 20 --eval-steps 10 --save-steps 10 --eval-samples 64

  # Rehearse the precision check for a given accelerator
  vlm-sft --accelerator "Tesla V100" --compute-capability 7.0

TARGET MODULES:
  all-linear                 every 2-D projection except embeddings and lm_head
  q_proj,k_proj,v_proj       exact names (matched against the module path suffix)
  re:.*(q|v)_proj            full-match regular expression

MODEL DIRECTORY:
  config.json                architecture description
  *.safetensors              weight shards (headers are indexed, tensors are not read)
  tokenizer.json             required
  tokenizer_config.json      special tokens, chat template hints
  preprocessor_config.json   image size, rescale and normalization

OUTPUTS (under --output-dir):
  adapter_config.json, adapter_model.safetensors
  training_args.json, trainer_state.json
  train_results.json, all_results.json
  checkpoint-<step>/         at most --save-total-limit kept

ENVIRONMENT VARIABLES:
  Every flag can be set as VLM_SFT_<FLAG>, e.g. VLM_SFT_LEARNING_RATE=2e-5.
  RUST_LOG                   overrides the log filter (e.g. vlm_sft=debug)
"#;

/// Supervised LoRA fine-tuning of image + text instruction models.
#[derive(Parser, Debug)]
#[command(
    name = "vlm-sft",
    version,
    about = "Supervised LoRA fine-tuning of image + text instruction models",
    long_about = "Prepare an image + text instruction dataset, attach LoRA adapters to a \
pretrained vision-language model and run the fine-tuning loop: collation, label masking, \
step planning, evaluation, checkpoint rotation and offline experiment tracking.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// JSON config file; flags given on the command line override its values.
    #[arg(long, env = "VLM_SFT_CONFIG")]
    config: Option<PathBuf>,

    // ── Model ──
    /// Local directory of the pretrained model.
    #[arg(long, env = "VLM_SFT_MODEL")]
    model: Option<PathBuf>,

    /// Where adapters, checkpoints and results are written.
    #[arg(short, long, env = "VLM_SFT_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Numeric precision: bf16, f16, f32.
    #[arg(long, env = "VLM_SFT_PRECISION", value_enum)]
    precision: Option<PrecisionArg>,

    // ── Dataset ──
    /// Dataset name recorded in tracking.
    #[arg(long, env = "VLM_SFT_DATASET")]
    dataset: Option<String>,

    /// Keep only records whose image path contains this marker.
    #[arg(long, env = "VLM_SFT_SUBSET")]
    subset: Option<String>,

    /// Directory searched for the dataset JSON/JSONL file.
    #[arg(long, env = "VLM_SFT_DATASET_CACHE")]
    dataset_cache: Option<PathBuf>,

    /// Root that relative image paths are resolved against.
    #[arg(long, env = "VLM_SFT_IMAGE_FOLDER")]
    image_folder: Option<PathBuf>,

    /// Cap on training samples after the split.
    #[arg(long, env = "VLM_SFT_TRAIN_SAMPLES")]
    train_samples: Option<usize>,

    /// Held-out evaluation samples (0 disables evaluation).
    #[arg(long, env = "VLM_SFT_EVAL_SAMPLES")]
    eval_samples: Option<usize>,

    /// Seed for shuffling, the split and adapter initialization.
    #[arg(long, env = "VLM_SFT_SEED")]
    seed: Option<u64>,

    // ── Processor ──
    /// Token budget per sample.
    #[arg(long, env = "VLM_SFT_MAX_SEQ_LENGTH")]
    max_seq_length: Option<usize>,

    /// Chat format: gemma, chatml.
    #[arg(long, env = "VLM_SFT_CHAT_TEMPLATE", value_enum)]
    chat_template: Option<TemplateArg>,

    // ── LoRA ──
    /// Adapter rank.
    #[arg(long, env = "VLM_SFT_LORA_R")]
    lora_r: Option<usize>,

    /// Adapter scaling numerator (scaling = alpha / r).
    #[arg(long, env = "VLM_SFT_LORA_ALPHA")]
    lora_alpha: Option<u32>,

    /// Adapter dropout probability.
    #[arg(long, env = "VLM_SFT_LORA_DROPOUT")]
    lora_dropout: Option<f32>,

    /// all-linear, a comma-separated list, or re:<pattern>.
    #[arg(long, env = "VLM_SFT_TARGET_MODULES")]
    target_modules: Option<String>,

    // ── Hyperparameters ──
    #[arg(long, env = "VLM_SFT_EPOCHS")]
    epochs: Option<usize>,

    #[arg(long, env = "VLM_SFT_BATCH_SIZE")]
    batch_size: Option<usize>,

    #[arg(long, env = "VLM_SFT_EVAL_BATCH_SIZE")]
    eval_batch_size: Option<usize>,

    #[arg(long, env = "VLM_SFT_GRAD_ACCUM")]
    gradient_accumulation_steps: Option<usize>,

    #[arg(long, env = "VLM_SFT_LEARNING_RATE")]
    learning_rate: Option<f64>,

    /// Fraction of steps spent warming up the learning rate.
    #[arg(long, env = "VLM_SFT_WARMUP_RATIO")]
    warmup_ratio: Option<f64>,

    /// constant, linear, cosine.
    #[arg(long, env = "VLM_SFT_LR_SCHEDULER")]
    lr_scheduler: Option<LrSchedulerType>,

    /// Stop after this many optimizer steps.
    #[arg(long, env = "VLM_SFT_MAX_STEPS")]
    max_steps: Option<usize>,

    // ── Cadence ──
    #[arg(long, env = "VLM_SFT_LOGGING_STEPS")]
    logging_steps: Option<usize>,

    #[arg(long, env = "VLM_SFT_EVAL_STEPS")]
    eval_steps: Option<usize>,

    #[arg(long, env = "VLM_SFT_SAVE_STEPS")]
    save_steps: Option<usize>,

    /// Checkpoints kept on disk.
    #[arg(long, env = "VLM_SFT_SAVE_TOTAL_LIMIT")]
    save_total_limit: Option<usize>,

    // ── Tracking ──
    /// Experiment tracking: offline, disabled.
    #[arg(long, env = "VLM_SFT_TRACKING", value_enum)]
    tracking: Option<TrackingArg>,

    #[arg(long, env = "VLM_SFT_TRACKING_DIR")]
    tracking_dir: Option<PathBuf>,

    #[arg(long, env = "VLM_SFT_PROJECT")]
    project: Option<String>,

    /// Run name; defaults to <prefix>-<timestamp>.
    #[arg(long, env = "VLM_SFT_RUN_NAME")]
    run_name: Option<String>,

    // ── System ──
    /// Batches collated ahead of the step.
    #[arg(long, env = "VLM_SFT_WORKERS")]
    workers: Option<usize>,

    /// Data-parallel replicas reported to the planner.
    #[arg(long, env = "VLM_SFT_DEVICES", default_value_t = 1)]
    devices: usize,

    /// Accelerator name for the precision check.
    #[arg(long, env = "VLM_SFT_ACCELERATOR", requires = "compute_capability")]
    accelerator: Option<String>,

    /// Accelerator compute capability, e.g. 8.0.
    #[arg(long, env = "VLM_SFT_COMPUTE_CAPABILITY", value_parser = parse_capability)]
    compute_capability: Option<(u32, u32)>,

    // ── Modes ──
    /// Print dataset statistics only; the model is not loaded.
    #[arg(long, conflicts_with = "prepare_only")]
    inspect_only: bool,

    /// Write normalized train.jsonl / eval.jsonl into this directory and exit.
    #[arg(long)]
    prepare_only: Option<PathBuf>,

    /// Print the run summary as JSON on stdout.
    #[arg(long, env = "VLM_SFT_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "VLM_SFT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "VLM_SFT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "VLM_SFT_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PrecisionArg {
    Bf16,
    F16,
    F32,
}

impl From<PrecisionArg> for Precision {
    fn from(v: PrecisionArg) -> Self {
        match v {
            PrecisionArg::Bf16 => Precision::Bf16,
            PrecisionArg::F16 => Precision::F16,
            PrecisionArg::F32 => Precision::F32,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TemplateArg {
    Gemma,
    Chatml,
}

impl From<TemplateArg> for ChatTemplate {
    fn from(v: TemplateArg) -> Self {
        match v {
            TemplateArg::Gemma => ChatTemplate::Gemma,
            TemplateArg::Chatml => ChatTemplate::ChatMl,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TrackingArg {
    Offline,
    Disabled,
}

impl From<TrackingArg> for TrackingMode {
    fn from(v: TrackingArg) -> Self {
        match v {
            TrackingArg::Offline => TrackingMode::Offline,
            TrackingArg::Disabled => TrackingMode::Disabled,
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs unless --verbose is given.
    let show_progress =
        !cli.quiet && !cli.no_progress && !cli.json && !cli.inspect_only && cli.prepare_only.is_none();
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn TrainingProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let stats = inspect(&config).await.context("Failed to inspect dataset")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).context("Failed to serialize statistics")?
            );
        } else {
            println!("Source:       {}", stats.source.display());
            println!("Records:      {}", stats.total);
            println!(
                "Subset:       {} ('{}')",
                stats.filtered, config.dataset_subset
            );
            println!("Train:        {}", stats.train);
            println!("Eval:         {}", stats.eval);
        }
        return Ok(());
    }

    // ── Prepare-only mode ────────────────────────────────────────────────
    if let Some(ref dir) = cli.prepare_only {
        let (split, train_path, eval_path) = prepare(&config, dir)
            .await
            .context("Failed to prepare dataset")?;
        if !cli.quiet {
            eprintln!(
                "{}  {} train → {}",
                green("✔"),
                split.train.len(),
                bold(&train_path.display().to_string())
            );
            eprintln!(
                "{}  {} eval  → {}",
                green("✔"),
                split.eval.len(),
                bold(&eval_path.display().to_string())
            );
        }
        return Ok(());
    }

    // ── Run training ─────────────────────────────────────────────────────
    let mut executor = DryRunExecutor::new().with_devices(cli.devices);
    if let (Some(name), Some(cc)) = (cli.accelerator.clone(), cli.compute_capability) {
        executor = executor.with_accelerator(AcceleratorInfo {
            name,
            compute_capability: cc,
        });
    }

    let summary = train(&config, &mut executor)
        .await
        .context("Training failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        eprintln!(
            "{}  {} steps  {:.1}s  →  {}",
            if summary.skipped_samples == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            summary.global_step,
            summary.metrics.train_runtime,
            bold(&summary.output_dir.display().to_string()),
        );
        eprintln!(
            "   {}",
            dim(&format!(
                "trainable params: {} || all params: {} || {} supervised tokens",
                summary.trainable_params, summary.all_params, summary.supervised_tokens
            ))
        );
        if let Some(eval_loss) = summary.eval_loss {
            eprintln!("   eval loss {eval_loss:.4}");
        }
        if summary.placeholder_batches > 0 {
            eprintln!(
                "   {} placeholder batches (every image in the batch failed)",
                red(&summary.placeholder_batches.to_string())
            );
        }
    }

    Ok(())
}

/// Map CLI args (over an optional config file) to `TrainingConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<TrainingConfig> {
    let mut b = match cli.config {
        Some(ref path) => TrainingConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => TrainingConfig::builder(),
    };

    if let Some(ref v) = cli.model {
        b = b.model_id(v);
    }
    if let Some(ref v) = cli.output_dir {
        b = b.output_dir(v);
    }
    if let Some(v) = cli.precision {
        b = b.precision(v.into());
    }
    if let Some(ref v) = cli.dataset {
        b = b.dataset_name(v);
    }
    if let Some(ref v) = cli.subset {
        b = b.dataset_subset(v);
    }
    if let Some(ref v) = cli.dataset_cache {
        b = b.dataset_cache_dir(v);
    }
    if let Some(ref v) = cli.image_folder {
        b = b.image_folder(v);
    }
    if cli.train_samples.is_some() {
        b = b.train_samples(cli.train_samples);
    }
    if let Some(v) = cli.eval_samples {
        b = b.eval_samples(v);
    }
    if let Some(v) = cli.seed {
        b = b.seed(v);
    }
    if let Some(v) = cli.max_seq_length {
        b = b.max_seq_length(v);
    }
    if let Some(v) = cli.chat_template {
        b = b.chat_template(v.into());
    }
    if let Some(v) = cli.lora_r {
        b = b.lora_r(v);
    }
    if let Some(v) = cli.lora_alpha {
        b = b.lora_alpha(v);
    }
    if let Some(v) = cli.lora_dropout {
        b = b.lora_dropout(v);
    }
    if let Some(ref v) = cli.target_modules {
        let targets: TargetModules = match v.parse() {
            Ok(t) => t,
            Err(never) => match never {},
        };
        b = b.target_modules(targets);
    }
    if let Some(v) = cli.epochs {
        b = b.num_train_epochs(v);
    }
    if let Some(v) = cli.batch_size {
        b = b.per_device_train_batch_size(v);
    }
    if let Some(v) = cli.eval_batch_size {
        b = b.per_device_eval_batch_size(v);
    }
    if let Some(v) = cli.gradient_accumulation_steps {
        b = b.gradient_accumulation_steps(v);
    }
    if let Some(v) = cli.learning_rate {
        b = b.learning_rate(v);
    }
    if let Some(v) = cli.warmup_ratio {
        b = b.warmup_ratio(v);
    }
    if let Some(v) = cli.lr_scheduler {
        b = b.lr_scheduler_type(v);
    }
    if cli.max_steps.is_some() {
        b = b.max_steps(cli.max_steps);
    }
    if let Some(v) = cli.logging_steps {
        b = b.logging_steps(v);
    }
    if let Some(v) = cli.eval_steps {
        b = b.eval_steps(v);
    }
    if let Some(v) = cli.save_steps {
        b = b.save_steps(v);
    }
    if cli.save_total_limit.is_some() {
        b = b.save_total_limit(cli.save_total_limit);
    }
    if let Some(v) = cli.tracking {
        b = b.tracking(v.into());
    }
    if let Some(ref v) = cli.tracking_dir {
        b = b.tracking_dir(v);
    }
    if let Some(ref v) = cli.project {
        b = b.tracking_project(v);
    }
    if let Some(ref v) = cli.run_name {
        b = b.run_name(v);
    }
    if let Some(v) = cli.workers {
        b = b.dataloader_num_workers(v);
    }
    if let Some(cb) = progress {
        b = b.progress_callback(cb);
    }

    b.build().context("Invalid configuration")
}

/// Parse `--compute-capability` ("8.0", "8", "9.0") into `(major, minor)`.
fn parse_capability(s: &str) -> Result<(u32, u32), String> {
    let (major, minor) = s.trim().split_once('.').unwrap_or((s.trim(), "0"));
    let major = major
        .parse()
        .map_err(|_| format!("invalid major version in '{s}'"))?;
    let minor = minor
        .parse()
        .map_err(|_| format!("invalid minor version in '{s}'"))?;
    Ok((major, minor))
}
