//! Progress-callback trait for training events.
//!
//! Inject an [`Arc<dyn TrainingProgressCallback>`] via
//! [`crate::config::TrainingConfigBuilder::progress_callback`] to receive
//! events as the driver moves through optimizer steps, evaluations and
//! checkpoints.
//!
//! # Example
//!
//! ```rust
//! use vlm_sft::{TrainingProgressCallback, TrainingConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     steps: Arc<AtomicUsize>,
//! }
//!
//! impl TrainingProgressCallback for CountingCallback {
//!     fn on_step(&self, step: usize, total_steps: usize, loss: f32, learning_rate: f64) {
//!         self.steps.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("step {}/{} loss={:.4} lr={:.2e}", step, total_steps, loss, learning_rate);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     steps: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = TrainingConfig::builder()
//!     .progress_callback(counter as Arc<dyn TrainingProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the training driver as the run progresses.
///
/// Implementations must be `Send + Sync`: `on_sample_skipped` fires from the
/// blocking pool where batches are collated, everything else from the driver
/// task. All methods default to no-ops.
pub trait TrainingProgressCallback: Send + Sync {
    /// Called once, after setup, before the first micro-batch.
    ///
    /// # Arguments
    /// * `total_steps`  : optimizer steps the run will take
    /// * `train_samples`: size of the training partition
    fn on_train_start(&self, total_steps: usize, train_samples: usize) {
        let _ = (total_steps, train_samples);
    }

    /// Called after every optimizer step.
    ///
    /// # Arguments
    /// * `step`         : 1-indexed global step
    /// * `total_steps`  : planned optimizer steps
    /// * `loss`         : mean micro-batch loss over the accumulation window
    /// * `learning_rate`: rate applied at this step
    fn on_step(&self, step: usize, total_steps: usize, loss: f32, learning_rate: f64) {
        let _ = (step, total_steps, loss, learning_rate);
    }

    /// Called after an evaluation pass.
    fn on_eval(&self, step: usize, eval_loss: f32) {
        let _ = (step, eval_loss);
    }

    /// Called after a checkpoint directory has been written.
    fn on_checkpoint(&self, step: usize, path: &std::path::Path) {
        let _ = (step, path);
    }

    /// Called when a sample is dropped from a batch because its image failed.
    ///
    /// # Arguments
    /// * `error`: human-readable description of the failure
    fn on_sample_skipped(&self, error: &str) {
        let _ = error;
    }

    /// Called once after the final adapter is saved.
    ///
    /// # Arguments
    /// * `global_step`: optimizer steps taken
    /// * `train_loss` : mean loss over the whole run
    fn on_train_complete(&self, global_step: usize, train_loss: f32) {
        let _ = (global_step, train_loss);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl TrainingProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::TrainingConfig`].
pub type ProgressCallback = Arc<dyn TrainingProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingCallback {
        steps: Arc<AtomicUsize>,
        evals: Arc<AtomicUsize>,
        skipped: Arc<AtomicUsize>,
        planned: Arc<AtomicUsize>,
        finished_at: Arc<AtomicUsize>,
    }

    impl TrainingProgressCallback for TrackingCallback {
        fn on_train_start(&self, total_steps: usize, _train_samples: usize) {
            self.planned.store(total_steps, Ordering::SeqCst);
        }

        fn on_step(&self, _step: usize, _total: usize, _loss: f32, _lr: f64) {
            self.steps.fetch_add(1, Ordering::SeqCst);
        }

        fn on_eval(&self, _step: usize, _eval_loss: f32) {
            self.evals.fetch_add(1, Ordering::SeqCst);
        }

        fn on_sample_skipped(&self, _error: &str) {
            self.skipped.fetch_add(1, Ordering::SeqCst);
        }

        fn on_train_complete(&self, global_step: usize, _train_loss: f32) {
            self.finished_at.store(global_step, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_train_start(10, 40);
        cb.on_step(1, 10, 1.5, 1e-5);
        cb.on_eval(1, 1.2);
        cb.on_checkpoint(1, std::path::Path::new("out/checkpoint-1"));
        cb.on_sample_skipped("image not found");
        cb.on_train_complete(10, 0.9);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback {
            steps: Arc::new(AtomicUsize::new(0)),
            evals: Arc::new(AtomicUsize::new(0)),
            skipped: Arc::new(AtomicUsize::new(0)),
            planned: Arc::new(AtomicUsize::new(0)),
            finished_at: Arc::new(AtomicUsize::new(0)),
        };

        tracker.on_train_start(3, 12);
        assert_eq!(tracker.planned.load(Ordering::SeqCst), 3);

        tracker.on_step(1, 3, 2.0, 1e-5);
        tracker.on_sample_skipped("Sample 1: image not found");
        tracker.on_step(2, 3, 1.8, 1e-5);
        tracker.on_eval(2, 1.7);
        tracker.on_step(3, 3, 1.6, 5e-6);

        assert_eq!(tracker.steps.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.evals.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.skipped.load(Ordering::SeqCst), 1);

        tracker.on_train_complete(3, 1.8);
        assert_eq!(tracker.finished_at.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: Arc<dyn TrainingProgressCallback> = Arc::new(NoopProgressCallback);
        cb.on_train_start(10, 100);
        cb.on_step(1, 10, 0.5, 2e-5);
    }
}
