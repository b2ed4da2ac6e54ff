//! The training driver: setup, the step loop, evaluation, checkpoints and
//! final outputs.
//!
//! The driver owns everything except the numerics, which go through a
//! [`StepExecutor`]. Batches are collated on tokio's blocking pool, up to
//! `dataloader_num_workers` ahead of the step, in order.

use crate::args::{StepPlan, TrainingArguments};
use crate::checkpoint::{list_checkpoints, save_checkpoint, TrainerState};
use crate::config::TrainingConfig;
use crate::error::TuneError;
use crate::executor::{ExecutorError, StepExecutor};
use crate::lora::{attach_lora, AdaptedModel, LoraConfig};
use crate::model::{check_accelerator, PretrainedModel};
use crate::output::{write_json_atomic, DatasetStats, LogEntry, TrainMetrics, TrainingSummary};
use crate::pipeline::collate::{Batch, Collator};
use crate::pipeline::dataset::{self, export_split, prepare_dataset, DatasetSplit};
use crate::pipeline::messages::Sample;
use crate::pipeline::processor::{Processor, ProcessorOptions};
use crate::tracking::{init_tracker, ExperimentTracker, RunConfig};
use futures::stream::{self, Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Run a complete fine-tuning job described by `config`.
///
/// # Errors
/// Returns `Err(TuneError)` for fatal conditions only: the dataset is
/// missing, unparsable or empty after filtering; the model or processor
/// cannot be loaded; no LoRA target matched; the executor failed; an output
/// could not be written. Samples with unreadable images are skipped and
/// counted in [`TrainingSummary::skipped_samples`].
pub async fn train(
    config: &TrainingConfig,
    executor: &mut dyn StepExecutor,
) -> Result<TrainingSummary, TuneError> {
    let run_name = config.run_name().to_string();
    info!("Starting run '{}' with executor '{}'", run_name, executor.name());

    let args = TrainingArguments::from(config);
    let devices = executor.device_count();

    // ── Step 1: Experiment tracking ──────────────────────────────────────
    let run_config = RunConfig {
        model_id: config.model_id.clone(),
        dataset: config.dataset_name.clone(),
        lora_r: config.lora_r,
        lora_alpha: config.lora_alpha,
        learning_rate: config.learning_rate,
        batch_size: args.effective_batch_size(devices),
        num_epochs: config.num_train_epochs,
    };
    let mut tracker = init_tracker(
        config.tracking,
        &config.tracking_dir,
        &config.tracking_project,
        &run_name,
        &run_config,
    )?;

    // ── Step 2: Dataset ──────────────────────────────────────────────────
    let split = {
        let config = config.clone();
        blocking(move || prepare_dataset(&config)).await?
    };

    // ── Step 3: Model, accelerator, processor, adapters ──────────────────
    let model = {
        let dir = config.model_id.clone();
        let precision = config.precision;
        blocking(move || PretrainedModel::load(&dir, precision)).await?
    };
    if let Some(info) = executor.accelerator() {
        check_accelerator(&info);
    }
    let processor = {
        let dir = config.model_id.clone();
        let opts = ProcessorOptions::from(config);
        blocking(move || Processor::from_pretrained(&dir, &opts)).await?
    };
    let mut model = {
        let lora = LoraConfig::from(config);
        let seed = config.seed;
        blocking(move || attach_lora(model, &lora, seed)).await?
    };

    // ── Step 4: Collator ─────────────────────────────────────────────────
    let collator = Arc::new(
        Collator::new(Arc::new(processor), config.image_folder.clone())
            .with_progress(config.progress_callback.clone()),
    );

    // ── Step 5: Arguments and step plan ──────────────────────────────────
    let plan = args.plan(split.train.len());
    info!(
        "Plan: {} epochs × {} steps/epoch = {} steps ({} warmup), effective batch {}",
        args.num_train_epochs,
        plan.steps_per_epoch,
        plan.total_steps,
        plan.warmup_steps,
        args.effective_batch_size(devices)
    );
    executor
        .prepare(&model, &args)
        .map_err(|e| executor_failed(0, e))?;
    if let Some(ref cb) = config.progress_callback {
        cb.on_train_start(plan.total_steps, split.train.len());
    }

    // ── Step 6: Step loop ────────────────────────────────────────────────
    let run_start = Instant::now();
    let outcome = run_loop(
        config,
        &args,
        &plan,
        &split,
        &collator,
        &mut model,
        executor,
        tracker.as_mut(),
    )
    .await?;
    let runtime = run_start.elapsed().as_secs_f64();

    // ── Step 7: Final adapter, state and metrics ─────────────────────────
    let output_dir = args.output_dir.clone();
    run_blocking(|| -> Result<(), TuneError> {
        model.save_pretrained(&output_dir)?;
        write_json_atomic(&output_dir.join("training_args.json"), &args)?;
        outcome.state.save(&output_dir)
    })?;

    let train_loss = if outcome.state.global_step > 0 {
        (outcome.loss_sum / outcome.state.global_step as f64) as f32
    } else {
        0.0
    };
    let per_sec = |n: f64| if runtime > 0.0 { n / runtime } else { 0.0 };
    let mut summary = TrainingSummary {
        run_name,
        output_dir: output_dir.clone(),
        global_step: outcome.state.global_step,
        metrics: TrainMetrics {
            train_runtime: runtime,
            train_samples_per_second: per_sec(outcome.samples_seen as f64),
            train_steps_per_second: per_sec(outcome.state.global_step as f64),
            train_loss,
            epoch: outcome.state.epoch,
        },
        eval_loss: outcome.eval_loss,
        dataset: split.stats(),
        trainable_params: 0,
        all_params: 0,
        skipped_samples: outcome.skipped_samples,
        placeholder_batches: outcome.placeholder_batches,
        supervised_tokens: outcome.supervised_tokens,
        checkpoints: list_checkpoints(&output_dir).into_iter().map(|(_, p)| p).collect(),
    };
    summary.set_parameters(model.parameter_counts());
    summary.write_results(&output_dir)?;
    tracker.finish(&summary.scalars())?;

    info!(
        "Training complete: {} steps, loss {:.4}, {} samples skipped, {:.1}s",
        summary.global_step, train_loss, summary.skipped_samples, runtime
    );
    if let Some(ref cb) = config.progress_callback {
        cb.on_train_complete(summary.global_step, train_loss);
    }
    Ok(summary)
}

/// Synchronous wrapper around [`train`].
///
/// Creates a multi-threaded tokio runtime internally.
pub fn train_sync(
    config: &TrainingConfig,
    executor: &mut dyn StepExecutor,
) -> Result<TrainingSummary, TuneError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| TuneError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(train(config, executor))
}

/// Load, filter and split the dataset without touching the model.
pub async fn inspect(config: &TrainingConfig) -> Result<DatasetStats, TuneError> {
    let config = config.clone();
    let split = blocking(move || prepare_dataset(&config)).await?;
    Ok(split.stats())
}

/// Prepare the dataset and write `train.jsonl` / `eval.jsonl` into `dir`.
pub async fn prepare(
    config: &TrainingConfig,
    dir: impl AsRef<Path>,
) -> Result<(DatasetSplit, PathBuf, PathBuf), TuneError> {
    let config = config.clone();
    let dir = dir.as_ref().to_path_buf();
    blocking(move || {
        let split = prepare_dataset(&config)?;
        let (train_path, eval_path) = export_split(&split, &dir)?;
        Ok((split, train_path, eval_path))
    })
    .await
}

// ── Internal helpers ─────────────────────────────────────────────────────

struct LoopOutcome {
    state: TrainerState,
    loss_sum: f64,
    eval_loss: Option<f32>,
    samples_seen: usize,
    skipped_samples: usize,
    placeholder_batches: usize,
    supervised_tokens: u64,
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    config: &TrainingConfig,
    args: &TrainingArguments,
    plan: &StepPlan,
    split: &DatasetSplit,
    collator: &Arc<Collator>,
    model: &mut AdaptedModel,
    executor: &mut dyn StepExecutor,
    tracker: &mut dyn ExperimentTracker,
) -> Result<LoopOutcome, TuneError> {
    let mut out = LoopOutcome {
        state: TrainerState::new(args, plan.total_steps),
        loss_sum: 0.0,
        eval_loss: None,
        samples_seen: 0,
        skipped_samples: 0,
        placeholder_batches: 0,
        supervised_tokens: 0,
    };
    let accumulation = args.gradient_accumulation_steps.max(1);
    let has_eval = !split.eval.is_empty();
    let mut window: Vec<f32> = Vec::with_capacity(accumulation);
    let mut since_log = (0.0f64, 0usize);
    let mut last_eval_step = None;

    'epochs: for epoch in 0..args.num_train_epochs {
        if out.state.global_step >= plan.total_steps {
            break;
        }
        let order = dataset::shuffle(split.train.clone(), args.seed.wrapping_add(epoch as u64));
        let micro_batches = plan.micro_batches_per_epoch;
        debug!("Epoch {}: {} micro-batches", epoch + 1, micro_batches);

        let mut batches = Box::pin(prefetch(
            Arc::clone(collator),
            order,
            args.per_device_train_batch_size,
            args.dataloader_num_workers,
        ));
        let mut micro = 0usize;

        while let Some(batch) = batches.next().await {
            let batch = batch?;
            micro += 1;
            out.skipped_samples += batch.skipped.len();
            if batch.is_placeholder() {
                out.placeholder_batches += 1;
                out.samples_seen += batch.skipped.len();
            } else {
                out.samples_seen += batch.len() + batch.skipped.len();
            }
            out.supervised_tokens += batch.supervised_tokens() as u64;

            let step = out.state.global_step + 1;
            let loss = run_blocking(|| executor.forward_backward(model, &batch))
                .map_err(|e| executor_failed(step, e))?;
            window.push(loss);

            if window.len() < accumulation && micro < micro_batches {
                continue;
            }

            // ── Optimizer step ──
            let lr = args.learning_rate_at(out.state.global_step, plan);
            let grad_norm = run_blocking(|| executor.optimizer_step(model, lr, args.max_grad_norm))
                .map_err(|e| executor_failed(step, e))?;
            let step_loss = window.iter().sum::<f32>() / window.len() as f32;
            window.clear();

            out.state.global_step = step;
            out.state.epoch = epoch as f64 + micro as f64 / micro_batches.max(1) as f64;
            out.loss_sum += f64::from(step_loss);
            since_log.0 += f64::from(step_loss);
            since_log.1 += 1;

            if let Some(ref cb) = config.progress_callback {
                cb.on_step(step, plan.total_steps, step_loss, lr);
            }

            if step % args.logging_steps == 0 {
                let entry = LogEntry {
                    step,
                    epoch: out.state.epoch,
                    loss: Some((since_log.0 / since_log.1 as f64) as f32),
                    learning_rate: Some(lr),
                    grad_norm,
                    eval_loss: None,
                };
                since_log = (0.0, 0);
                info!(
                    "step {}/{} epoch {:.2} loss {:.4} lr {:.3e}",
                    step,
                    plan.total_steps,
                    entry.epoch,
                    entry.loss.unwrap_or_default(),
                    lr
                );
                tracker.log(step, &entry.metrics())?;
                out.state.log_history.push(entry);
            }

            if has_eval && step % args.eval_steps == 0 {
                let eval_loss = evaluate(config, args, &split.eval, collator, model, executor, step).await?;
                record_eval(&mut out, tracker, config, step, eval_loss)?;
                last_eval_step = Some(step);
            }

            if step % args.save_steps == 0 {
                let dir = run_blocking(|| save_checkpoint(model, &out.state, args))?;
                if let Some(ref cb) = config.progress_callback {
                    cb.on_checkpoint(step, &dir);
                }
            }

            if step >= plan.total_steps {
                break 'epochs;
            }
        }
    }

    if has_eval && out.state.global_step > 0 && last_eval_step != Some(out.state.global_step) {
        let step = out.state.global_step;
        let eval_loss = evaluate(config, args, &split.eval, collator, model, executor, step).await?;
        record_eval(&mut out, tracker, config, step, eval_loss)?;
    }

    Ok(out)
}

fn record_eval(
    out: &mut LoopOutcome,
    tracker: &mut dyn ExperimentTracker,
    config: &TrainingConfig,
    step: usize,
    eval_loss: f32,
) -> Result<(), TuneError> {
    let entry = LogEntry {
        step,
        epoch: out.state.epoch,
        eval_loss: Some(eval_loss),
        ..Default::default()
    };
    tracker.log(step, &entry.metrics())?;
    out.state.log_history.push(entry);
    out.eval_loss = Some(eval_loss);
    if let Some(ref cb) = config.progress_callback {
        cb.on_eval(step, eval_loss);
    }
    Ok(())
}

/// Mean loss over the evaluation partition.
async fn evaluate(
    config: &TrainingConfig,
    args: &TrainingArguments,
    samples: &[Sample],
    collator: &Arc<Collator>,
    model: &AdaptedModel,
    executor: &mut dyn StepExecutor,
    step: usize,
) -> Result<f32, TuneError> {
    let started = Instant::now();
    let mut batches = Box::pin(prefetch(
        Arc::clone(collator),
        samples.to_vec(),
        args.per_device_eval_batch_size,
        config.dataloader_num_workers,
    ));
    let (mut sum, mut count, mut skipped) = (0.0f64, 0usize, 0usize);
    while let Some(batch) = batches.next().await {
        let batch = batch?;
        skipped += batch.skipped.len();
        let loss = run_blocking(|| executor.evaluate(model, &batch)).map_err(|e| executor_failed(step, e))?;
        sum += f64::from(loss);
        count += 1;
    }
    let eval_loss = if count > 0 { (sum / count as f64) as f32 } else { 0.0 };
    if skipped > 0 {
        warn!("Evaluation at step {} skipped {} samples", step, skipped);
    }
    info!(
        "eval at step {}: loss {:.4} over {} batches ({}ms)",
        step,
        eval_loss,
        count,
        started.elapsed().as_millis()
    );
    Ok(eval_loss)
}

/// Collate `samples` in chunks of `batch_size` on the blocking pool, keeping
/// up to `workers` batches in flight and yielding them in order.
fn prefetch(
    collator: Arc<Collator>,
    samples: Vec<Sample>,
    batch_size: usize,
    workers: usize,
) -> impl Stream<Item = Result<Batch, TuneError>> {
    let chunks: Vec<Vec<Sample>> = samples
        .chunks(batch_size.max(1))
        .map(<[Sample]>::to_vec)
        .collect();
    stream::iter(chunks)
        .map(move |chunk| {
            let collator = Arc::clone(&collator);
            tokio::task::spawn_blocking(move || collator.collate(&chunk))
        })
        .buffered(workers.max(1))
        .map(|joined| {
            joined.unwrap_or_else(|e| Err(TuneError::Internal(format!("collate task failed: {e}"))))
        })
}

/// Run CPU- or I/O-heavy setup work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, TuneError>
where
    F: FnOnce() -> Result<T, TuneError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TuneError::Internal(format!("blocking task failed: {e}")))?
}

/// Run a synchronous call from the driver task without stalling other tasks
/// on a multi-threaded runtime.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn executor_failed(step: usize, e: ExecutorError) -> TuneError {
    TuneError::Executor {
        step,
        detail: e.to_string(),
    }
}
