//! The seam between the data pipeline and the numerical training backend.
//!
//! The driver owns the data path, cadences and bookkeeping; a
//! [`StepExecutor`] owns the tensors. Implement the trait over your
//! framework of choice to run real forward/backward passes.

use crate::args::TrainingArguments;
use crate::lora::AdaptedModel;
use crate::model::AcceleratorInfo;
use crate::pipeline::collate::Batch;
use thiserror::Error;
use tracing::debug;

/// A failure reported by the backend. The driver attaches the step number.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ExecutorError(pub String);

impl From<String> for ExecutorError {
    fn from(s: String) -> Self {
        ExecutorError(s)
    }
}

impl From<&str> for ExecutorError {
    fn from(s: &str) -> Self {
        ExecutorError(s.to_string())
    }
}

/// Runs forward/backward passes and optimizer updates.
///
/// Calls arrive from the driver task (wrapped in `block_in_place`), never
/// concurrently.
pub trait StepExecutor: Send {
    /// Short name for logs.
    fn name(&self) -> &str {
        "executor"
    }

    /// Data-parallel replicas; scales the effective batch size.
    fn device_count(&self) -> usize {
        1
    }

    /// Accelerator details, checked once before training starts.
    fn accelerator(&self) -> Option<AcceleratorInfo> {
        None
    }

    /// Called once with the adapted model and arguments before the first step.
    fn prepare(&mut self, model: &AdaptedModel, args: &TrainingArguments) -> Result<(), ExecutorError> {
        let _ = (model, args);
        Ok(())
    }

    /// Forward and backward pass for one micro-batch, accumulating gradients.
    /// Returns the micro-batch loss. A batch whose labels are all ignored must
    /// contribute no gradient.
    fn forward_backward(&mut self, model: &mut AdaptedModel, batch: &Batch) -> Result<f32, ExecutorError>;

    /// Clip accumulated gradients to `max_grad_norm`, apply the update at
    /// `learning_rate` and zero the gradients. Returns the pre-clip norm when
    /// the backend tracks it.
    fn optimizer_step(
        &mut self,
        model: &mut AdaptedModel,
        learning_rate: f64,
        max_grad_norm: f64,
    ) -> Result<Option<f64>, ExecutorError>;

    /// Loss on one evaluation batch, without gradients.
    fn evaluate(&mut self, model: &AdaptedModel, batch: &Batch) -> Result<f32, ExecutorError>;
}

/// Walks the full data path without touching weights.
///
/// Every batch is collated, counted and "stepped", with loss 0. Useful to
/// validate a dataset, image folder and cadence settings before a real run.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    accelerator: Option<AcceleratorInfo>,
    devices: usize,
    pub micro_batches: usize,
    pub placeholder_batches: usize,
    pub supervised_tokens: u64,
    pub optimizer_steps: usize,
    pub eval_batches: usize,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self {
            devices: 1,
            ..Default::default()
        }
    }

    /// Report this accelerator, e.g. to rehearse the capability check.
    pub fn with_accelerator(mut self, info: AcceleratorInfo) -> Self {
        self.accelerator = Some(info);
        self
    }

    pub fn with_devices(mut self, n: usize) -> Self {
        self.devices = n.max(1);
        self
    }
}

impl StepExecutor for DryRunExecutor {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn device_count(&self) -> usize {
        self.devices.max(1)
    }

    fn accelerator(&self) -> Option<AcceleratorInfo> {
        self.accelerator.clone()
    }

    fn forward_backward(&mut self, _model: &mut AdaptedModel, batch: &Batch) -> Result<f32, ExecutorError> {
        self.micro_batches += 1;
        if batch.is_placeholder() {
            self.placeholder_batches += 1;
        }
        self.supervised_tokens += batch.supervised_tokens() as u64;
        Ok(0.0)
    }

    fn optimizer_step(
        &mut self,
        _model: &mut AdaptedModel,
        learning_rate: f64,
        _max_grad_norm: f64,
    ) -> Result<Option<f64>, ExecutorError> {
        self.optimizer_steps += 1;
        debug!("dry-run step {} at lr {:.3e}", self.optimizer_steps, learning_rate);
        Ok(None)
    }

    fn evaluate(&mut self, _model: &AdaptedModel, _batch: &Batch) -> Result<f32, ExecutorError> {
        self.eval_batches += 1;
        Ok(0.0)
    }
}
