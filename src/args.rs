//! Training arguments handed to the step executor, and the step plan and
//! learning-rate schedule derived from them.

use crate::config::TrainingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Learning-rate decay after warmup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedulerType {
    Constant,
    Linear,
    #[default]
    Cosine,
}

impl std::str::FromStr for LrSchedulerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            other => Err(format!("unknown scheduler '{other}' (constant, linear, cosine)")),
        }
    }
}

/// The trainer-facing view of a [`TrainingConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    pub output_dir: PathBuf,
    pub run_name: String,
    pub seed: u64,
    pub num_train_epochs: usize,
    pub max_steps: Option<usize>,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub lr_scheduler_type: LrSchedulerType,
    pub warmup_ratio: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub optim: String,
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: Option<usize>,
    pub bf16: bool,
    pub tf32: bool,
    pub gradient_checkpointing: bool,
    pub dataloader_num_workers: usize,
    pub deepspeed: Option<PathBuf>,
}

impl From<&TrainingConfig> for TrainingArguments {
    fn from(c: &TrainingConfig) -> Self {
        Self {
            output_dir: c.output_dir.clone(),
            run_name: c.run_name().to_string(),
            seed: c.seed,
            num_train_epochs: c.num_train_epochs,
            max_steps: c.max_steps,
            per_device_train_batch_size: c.per_device_train_batch_size,
            per_device_eval_batch_size: c.per_device_eval_batch_size,
            gradient_accumulation_steps: c.gradient_accumulation_steps,
            learning_rate: c.learning_rate,
            lr_scheduler_type: c.lr_scheduler_type,
            warmup_ratio: c.warmup_ratio,
            weight_decay: c.weight_decay,
            max_grad_norm: c.max_grad_norm,
            optim: c.optim.clone(),
            logging_steps: c.logging_steps,
            eval_steps: c.eval_steps,
            save_steps: c.save_steps,
            save_total_limit: c.save_total_limit,
            bf16: c.bf16,
            tf32: c.tf32,
            gradient_checkpointing: c.gradient_checkpointing,
            dataloader_num_workers: c.dataloader_num_workers,
            deepspeed: c.deepspeed.clone(),
        }
    }
}

/// Step counts for a run over a training partition of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepPlan {
    pub micro_batches_per_epoch: usize,
    pub steps_per_epoch: usize,
    pub total_steps: usize,
    pub warmup_steps: usize,
}

impl TrainingArguments {
    /// Samples per optimizer step across all devices.
    pub fn effective_batch_size(&self, device_count: usize) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps * device_count.max(1)
    }

    /// Plan optimizer steps for `train_len` samples.
    ///
    /// A trailing partial accumulation window still takes a step, so
    /// `steps_per_epoch = ceil(micro_batches / accumulation)`.
    pub fn plan(&self, train_len: usize) -> StepPlan {
        let micro_batches_per_epoch = train_len.div_ceil(self.per_device_train_batch_size.max(1));
        let steps_per_epoch = micro_batches_per_epoch.div_ceil(self.gradient_accumulation_steps.max(1));
        let mut total_steps = self.num_train_epochs * steps_per_epoch;
        if let Some(cap) = self.max_steps {
            total_steps = total_steps.min(cap);
        }
        let warmup_steps = (self.warmup_ratio * total_steps as f64).ceil() as usize;
        StepPlan {
            micro_batches_per_epoch,
            steps_per_epoch,
            total_steps,
            warmup_steps,
        }
    }

    /// Learning rate for the optimizer step taken after `completed` steps.
    pub fn learning_rate_at(&self, completed: usize, plan: &StepPlan) -> f64 {
        let base = self.learning_rate;
        let warmup = plan.warmup_steps;
        if completed < warmup {
            return base * completed as f64 / warmup.max(1) as f64;
        }
        let decay_steps = plan.total_steps.saturating_sub(warmup).max(1) as f64;
        let progress = (completed - warmup) as f64 / decay_steps;
        match self.lr_scheduler_type {
            LrSchedulerType::Constant => base,
            LrSchedulerType::Linear => base * (1.0 - progress).max(0.0),
            LrSchedulerType::Cosine => {
                base * (0.5 * (1.0 + (std::f64::consts::PI * progress).cos())).max(0.0)
            }
        }
    }
}
