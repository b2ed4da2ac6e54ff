//! Integration tests for vlm-sft.
//!
//! Every test builds its own fixture tree in a temp directory: a tiny
//! word-level tokenizer, a two-layer safetensors checkpoint, PNG images and
//! a dataset file. No network, no accelerator.

use ahash::AHashMap;
use image::{Rgb, RgbImage};
use safetensors::tensor::{Dtype, TensorView};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{AddedToken, Tokenizer};
use vlm_sft::pipeline::dataset::{self, filter_subset, load_samples};
use vlm_sft::{
    prepare_dataset, train, Collator, DryRunExecutor, Processor, ProcessorOptions,
    SampleError, TrackingMode, TrainingConfig, TrainingProgressCallback, TuneError,
    IGNORE_INDEX,
};

// ── Fixtures ─────────────────────────────────────────────────────────────────

const SPECIALS: [&str; 9] = [
    "<pad>",
    "<bos>",
    "<eos>",
    "<start_of_image>",
    "<end_of_image>",
    "<image_soft_token>",
    "<start_of_turn>",
    "<end_of_turn>",
    "<unk>",
];
const WORDS: [&str; 8] = ["user", "model", "what", "rhythm", "is", "this", "sinus", "normal"];

const PAD: u32 = 0;
const BOI: u32 = 3;
const IMAGE_SOFT: u32 = 5;

/// Writes the model directory: tokenizer, processor configs, `config.json`
/// and one weight shard.
fn write_model(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();

    let mut vocab: AHashMap<String, u32> = AHashMap::new();
    for t in SPECIALS.iter().chain(WORDS.iter()) {
        let id = vocab.len() as u32;
        vocab.insert(t.to_string(), id);
    }
    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("<unk>".into())
        .build()
        .unwrap();
    let mut tok = Tokenizer::new(model);
    tok.with_pre_tokenizer(Some(Whitespace::default()));
    let specials: Vec<AddedToken> = SPECIALS
        .iter()
        .map(|t| AddedToken::from(t.to_string(), true))
        .collect();
    tok.add_special_tokens(&specials);
    tok.save(dir.join("tokenizer.json"), false).unwrap();

    std::fs::write(
        dir.join("tokenizer_config.json"),
        r#"{"pad_token": "<pad>", "bos_token": "<bos>", "eos_token": "<eos>",
            "boi_token": "<start_of_image>", "eoi_token": "<end_of_image>",
            "image_token": "<image_soft_token>", "padding_side": "right"}"#,
    )
    .unwrap();
    std::fs::write(
        dir.join("preprocessor_config.json"),
        r#"{"size": {"height": 8, "width": 8}, "do_resize": true, "do_rescale": true,
            "rescale_factor": 0.00392156862745098, "do_normalize": true,
            "image_mean": [0.5, 0.5, 0.5], "image_std": [0.5, 0.5, 0.5]}"#,
    )
    .unwrap();
    std::fs::write(dir.join("processor_config.json"), r#"{"image_seq_length": 4}"#).unwrap();
    std::fs::write(
        dir.join("config.json"),
        r#"{"architectures": ["Gemma3ForConditionalGeneration"], "model_type": "gemma3",
            "torch_dtype": "bfloat16"}"#,
    )
    .unwrap();

    let shapes: [(&str, Vec<usize>); 6] = [
        ("model.embed_tokens.weight", vec![17, 8]),
        ("model.layers.0.self_attn.q_proj.weight", vec![8, 8]),
        ("model.layers.0.self_attn.v_proj.weight", vec![8, 8]),
        ("model.layers.0.mlp.down_proj.weight", vec![8, 16]),
        ("model.layers.0.input_layernorm.weight", vec![8]),
        ("lm_head.weight", vec![17, 8]),
    ];
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = shapes
        .iter()
        .map(|(name, shape)| {
            let n: usize = shape.iter().product();
            (name.to_string(), shape.clone(), vec![0u8; n * 2])
        })
        .collect();
    let views: Vec<(String, TensorView<'_>)> = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            (name.clone(), TensorView::new(Dtype::BF16, shape.clone(), bytes).unwrap())
        })
        .collect();
    safetensors::serialize_to_file(views, &None, &dir.join("model.safetensors")).unwrap();
}

fn write_png(path: &Path, shade: u8) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbImage::from_pixel(12, 10, Rgb([shade, 255 - shade, 128]))
        .save(path)
        .unwrap();
}

fn record(id: usize, image: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "image": image,
        "conversations": [
            {"from": "human", "value": "<image>\nwhat rhythm is this"},
            {"from": "gpt", "value": "normal sinus rhythm"}
        ]
    })
}

/// A workspace with a model, an image folder and a dataset cache holding
/// `ptb_xl` ECG records plus `other` records from a different source.
struct Fixture {
    _root: tempfile::TempDir,
    model: PathBuf,
    images: PathBuf,
    cache: PathBuf,
    out: PathBuf,
    tracking: PathBuf,
}

impl Fixture {
    fn new(ptb_xl: usize, other: usize) -> Self {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().to_path_buf();
        let fixture = Fixture {
            model: base.join("model"),
            images: base.join("images"),
            cache: base.join("cache"),
            out: base.join("out"),
            tracking: base.join("wandb"),
            _root: root,
        };
        write_model(&fixture.model);

        let mut records = Vec::new();
        for i in 0..ptb_xl {
            let rel = format!("ptb-xl/{i:05}_hr.png");
            write_png(&fixture.images.join(&rel), (i * 20) as u8);
            records.push(record(i, &rel));
        }
        for i in 0..other {
            let rel = format!("code15/{i:05}.png");
            write_png(&fixture.images.join(&rel), 7);
            records.push(record(1000 + i, &rel));
        }
        fixture.write_dataset(&records);
        fixture
    }

    fn write_dataset(&self, records: &[serde_json::Value]) {
        let dir = self.cache.join("ECGInstruct");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("ECGInstruct.json"),
            serde_json::to_string(records).unwrap(),
        )
        .unwrap();
    }

    fn config(&self) -> vlm_sft::TrainingConfigBuilder {
        TrainingConfig::builder()
            .model_id(&self.model)
            .dataset_cache_dir(&self.cache)
            .image_folder(&self.images)
            .output_dir(&self.out)
            .tracking_dir(&self.tracking)
            .run_name("test-run")
            .max_seq_length(128)
            .dataloader_num_workers(2)
    }

    fn processor(&self) -> Arc<Processor> {
        let config = self.config().build().unwrap();
        Arc::new(Processor::from_pretrained(&self.model, &ProcessorOptions::from(&config)).unwrap())
    }
}

fn ids(samples: &[vlm_sft::Sample]) -> Vec<String> {
    samples.iter().map(|s| s.id.clone().unwrap_or_default()).collect()
}

#[derive(Default)]
struct Counting {
    steps: AtomicUsize,
    evals: AtomicUsize,
    checkpoints: AtomicUsize,
    skipped: AtomicUsize,
    completed: AtomicUsize,
}

impl TrainingProgressCallback for Counting {
    fn on_step(&self, _step: usize, _total: usize, _loss: f32, _lr: f64) {
        self.steps.fetch_add(1, Ordering::SeqCst);
    }
    fn on_eval(&self, _step: usize, _eval_loss: f32) {
        self.evals.fetch_add(1, Ordering::SeqCst);
    }
    fn on_checkpoint(&self, _step: usize, _path: &Path) {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
    }
    fn on_sample_skipped(&self, _error: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }
    fn on_train_complete(&self, _global_step: usize, _train_loss: f32) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Dataset preparation ──────────────────────────────────────────────────────

#[test]
fn empty_cache_dir_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let config = TrainingConfig::builder()
        .dataset_cache_dir(root.path())
        .build()
        .unwrap();
    let err = prepare_dataset(&config).unwrap_err();
    assert!(matches!(err, TuneError::DatasetNotFound { .. }), "got {err}");
}

#[test]
fn subset_filter_and_split_sizes() {
    let fx = Fixture::new(10, 4);
    let config = fx.config().eval_samples(3).build().unwrap();
    let split = prepare_dataset(&config).unwrap();
    assert_eq!(split.total, 14);
    assert_eq!(split.filtered, 10);
    assert_eq!(split.eval.len(), 3);
    assert_eq!(split.train.len(), 7);
    assert!(split
        .train
        .iter()
        .chain(split.eval.iter())
        .all(|s| s.image.contains("ptb-xl")));
}

#[test]
fn no_subset_match_is_empty_dataset() {
    let fx = Fixture::new(0, 5);
    let config = fx.config().eval_samples(1).build().unwrap();
    let err = prepare_dataset(&config).unwrap_err();
    assert!(
        matches!(err, TuneError::EmptyDataset { total: 5, .. }),
        "got {err}"
    );
}

#[test]
fn eval_request_larger_than_subset_fails() {
    let fx = Fixture::new(4, 0);
    let config = fx.config().eval_samples(4).build().unwrap();
    let err = prepare_dataset(&config).unwrap_err();
    assert!(
        matches!(err, TuneError::SplitTooSmall { available: 4, requested: 4 }),
        "got {err}"
    );
}

#[test]
fn split_is_deterministic_for_a_seed() {
    let fx = Fixture::new(12, 2);
    let a = prepare_dataset(&fx.config().eval_samples(3).seed(42).build().unwrap()).unwrap();
    let b = prepare_dataset(&fx.config().eval_samples(3).seed(42).build().unwrap()).unwrap();
    assert_eq!(ids(&a.train), ids(&b.train));
    assert_eq!(ids(&a.eval), ids(&b.eval));

    let c = prepare_dataset(&fx.config().eval_samples(3).seed(7).build().unwrap()).unwrap();
    let mut all_a: Vec<String> = ids(&a.train).into_iter().chain(ids(&a.eval)).collect();
    let mut all_c: Vec<String> = ids(&c.train).into_iter().chain(ids(&c.eval)).collect();
    assert_ne!(all_a, all_c, "different seeds should reorder");
    all_a.sort();
    all_c.sort();
    assert_eq!(all_a, all_c, "same records either way");
}

#[test]
fn train_cap_limits_training_partition() {
    let fx = Fixture::new(10, 0);
    let config = fx.config().eval_samples(2).train_samples(Some(5)).build().unwrap();
    let split = prepare_dataset(&config).unwrap();
    assert_eq!(split.train.len(), 5);
    assert_eq!(split.eval.len(), 2);
}

#[test]
fn subset_filter_is_idempotent() {
    let fx = Fixture::new(5, 5);
    let path = dataset::discover_dataset_file(&fx.cache).unwrap();
    let samples = load_samples(&path).unwrap();
    let once = filter_subset(samples, "ptb-xl");
    let twice = filter_subset(once.clone(), "ptb-xl");
    assert_eq!(once, twice);
    assert_eq!(once.len(), 5);
}

#[test]
fn jsonl_dataset_loads() {
    let fx = Fixture::new(3, 0);
    std::fs::remove_dir_all(&fx.cache).unwrap();
    std::fs::create_dir_all(&fx.cache).unwrap();
    let lines: Vec<String> = (0..3)
        .map(|i| record(i, &format!("ptb-xl/{i:05}_hr.png")).to_string())
        .collect();
    std::fs::write(fx.cache.join("data.jsonl"), lines.join("\n\n")).unwrap();

    let split = prepare_dataset(&fx.config().eval_samples(1).build().unwrap()).unwrap();
    assert_eq!(split.total, 3);
    assert_eq!(split.train.len(), 2);
}

// ── Collation ────────────────────────────────────────────────────────────────

#[test]
fn missing_image_is_skipped_not_fatal() {
    let fx = Fixture::new(3, 0);
    std::fs::remove_file(fx.images.join("ptb-xl/00001_hr.png")).unwrap();
    let split_path = dataset::discover_dataset_file(&fx.cache).unwrap();
    let samples = load_samples(&split_path).unwrap();

    let cb = Arc::new(Counting::default());
    let collator = Collator::new(fx.processor(), &fx.images)
        .with_progress(Some(cb.clone() as Arc<dyn TrainingProgressCallback>));
    let batch = collator.collate(&samples).unwrap();

    assert!(!batch.is_placeholder());
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.labels.len(), 2);
    assert_eq!(batch.pixel_values.shape, [2, 3, 8, 8]);
    assert_eq!(batch.skipped.len(), 1);
    assert!(matches!(
        batch.skipped[0],
        SampleError::ImageNotFound { index: 1, .. }
    ));
    assert_eq!(cb.skipped.load(Ordering::SeqCst), 1);
}

#[test]
fn labels_mask_padding_and_image_tokens() {
    let fx = Fixture::new(2, 0);
    let path = dataset::discover_dataset_file(&fx.cache).unwrap();
    let mut samples = load_samples(&path).unwrap();
    // Make the second sample longer so the first gets padded.
    samples[1] = serde_json::from_value(serde_json::json!({
        "id": "long",
        "image": "ptb-xl/00001_hr.png",
        "conversations": [
            {"from": "human", "value": "<image>\nwhat rhythm is this"},
            {"from": "gpt", "value": "normal sinus rhythm normal sinus rhythm"}
        ]
    }))
    .unwrap();

    let collator = Collator::new(fx.processor(), &fx.images);
    let batch = collator.collate(&samples).unwrap();
    assert_eq!(batch.input_ids[0].len(), batch.input_ids[1].len());
    assert!(batch.attention_mask[0].contains(&0), "first row should be padded");

    for (ids, labels) in batch.input_ids.iter().zip(&batch.labels) {
        assert_eq!(ids.len(), labels.len());
        for (&id, &label) in ids.iter().zip(labels) {
            if id == PAD || id == BOI || id == IMAGE_SOFT {
                assert_eq!(label, IGNORE_INDEX);
            } else {
                assert_eq!(label, i64::from(id));
            }
        }
        assert_eq!(ids.iter().filter(|&&id| id == IMAGE_SOFT).count(), 4);
    }
    for (types, ids) in batch.token_type_ids.iter().zip(&batch.input_ids) {
        for (&t, &id) in types.iter().zip(ids) {
            assert_eq!(t == 1, id == IMAGE_SOFT);
        }
    }
    assert!(batch.supervised_tokens() > 0);
}

#[test]
fn all_images_missing_gives_placeholder_batch() {
    let fx = Fixture::new(2, 0);
    std::fs::remove_dir_all(&fx.images).unwrap();
    let path = dataset::discover_dataset_file(&fx.cache).unwrap();
    let samples = load_samples(&path).unwrap();

    let collator = Collator::new(fx.processor(), &fx.images);
    let batch = collator.collate(&samples).unwrap();
    assert!(batch.is_placeholder());
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.skipped.len(), 2);
    assert!(batch.labels[0].iter().all(|&l| l == IGNORE_INDEX));
    assert_eq!(batch.supervised_tokens(), 0);
    assert_eq!(batch.pixel_values.shape, [1, 3, 8, 8]);
}

/// Rewrites the fixture's preprocessor config with resizing switched off.
fn disable_resize(model: &Path) {
    std::fs::write(
        model.join("preprocessor_config.json"),
        r#"{"size": {"height": 8, "width": 8}, "do_resize": false}"#,
    )
    .unwrap();
}

#[test]
fn resize_disabled_skips_images_of_another_size() {
    let fx = Fixture::new(3, 0);
    disable_resize(&fx.model);
    RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]))
        .save(fx.images.join("ptb-xl/00000_hr.png"))
        .unwrap();
    let path = dataset::discover_dataset_file(&fx.cache).unwrap();
    let samples = load_samples(&path).unwrap();

    let batch = Collator::new(fx.processor(), &fx.images).collate(&samples).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.pixel_values.shape, [1, 3, 8, 8]);
    assert_eq!(batch.pixel_values.data.len(), 3 * 8 * 8);
    assert_eq!(batch.skipped.len(), 2);
    assert!(matches!(
        batch.skipped[0],
        SampleError::ImageSizeMismatch { index: 1, width: 12, height: 10, .. }
    ));
}

#[test]
fn resize_disabled_placeholder_has_input_size() {
    let fx = Fixture::new(2, 0);
    disable_resize(&fx.model);
    let path = dataset::discover_dataset_file(&fx.cache).unwrap();
    let samples = load_samples(&path).unwrap();

    let batch = Collator::new(fx.processor(), &fx.images).collate(&samples).unwrap();
    assert!(batch.is_placeholder());
    assert_eq!(batch.pixel_values.shape, [1, 3, 8, 8]);
    assert_eq!(batch.pixel_values.data.len(), 3 * 8 * 8);
}

#[test]
fn sample_without_user_turn_is_skipped() {
    let fx = Fixture::new(3, 0);
    let path = dataset::discover_dataset_file(&fx.cache).unwrap();
    let mut samples = load_samples(&path).unwrap();
    samples[0] = serde_json::from_value(serde_json::json!({
        "id": "answer-only",
        "image": "ptb-xl/00000_hr.png",
        "conversations": [{"from": "gpt", "value": "normal sinus rhythm"}]
    }))
    .unwrap();

    let batch = Collator::new(fx.processor(), &fx.images).collate(&samples).unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.pixel_values.shape, [2, 3, 8, 8]);
    assert_eq!(
        batch.skipped,
        vec![SampleError::ImageMarkerMismatch { index: 0, markers: 0 }]
    );
    for ids in &batch.input_ids {
        assert_eq!(ids.iter().filter(|&&id| id == BOI).count(), 1);
    }
}

#[test]
fn collating_twice_is_identical() {
    let fx = Fixture::new(3, 0);
    let path = dataset::discover_dataset_file(&fx.cache).unwrap();
    let samples = load_samples(&path).unwrap();
    let collator = Collator::new(fx.processor(), &fx.images);
    let a = collator.collate(&samples).unwrap();
    let b = collator.collate(&samples).unwrap();
    assert_eq!(a.input_ids, b.input_ids);
    assert_eq!(a.labels, b.labels);
    assert_eq!(a.pixel_values.data, b.pixel_values.data);
}

// ── Full runs ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dry_run_writes_adapter_checkpoints_and_metrics() {
    let fx = Fixture::new(10, 2);
    let cb = Arc::new(Counting::default());
    // 8 train samples, batch 2, accumulation 2 → 2 steps/epoch, 6 steps total.
    let config = fx
        .config()
        .eval_samples(2)
        .num_train_epochs(3)
        .per_device_train_batch_size(2)
        .per_device_eval_batch_size(2)
        .gradient_accumulation_steps(2)
        .logging_steps(1)
        .eval_steps(3)
        .save_steps(2)
        .save_total_limit(Some(2))
        .progress_callback(cb.clone())
        .build()
        .unwrap();

    let mut ex = DryRunExecutor::new();
    let summary = train(&config, &mut ex).await.unwrap();

    assert_eq!(summary.global_step, 6);
    assert_eq!(ex.optimizer_steps, 6);
    assert_eq!(ex.micro_batches, 12);
    assert_eq!(ex.placeholder_batches, 0);
    assert_eq!(ex.eval_batches, 2, "one eval batch at step 3 and at step 6");
    assert_eq!(summary.skipped_samples, 0);
    assert_eq!(summary.dataset.filtered, 10);
    assert!(summary.supervised_tokens > 0);
    assert!(summary.trainable_params > 0);
    assert!(summary.trainable_params < summary.all_params);
    assert!(summary.eval_loss.is_some());
    assert!((summary.metrics.epoch - 3.0).abs() < 1e-9);

    assert_eq!(cb.steps.load(Ordering::SeqCst), 6);
    assert_eq!(cb.evals.load(Ordering::SeqCst), 2);
    assert_eq!(cb.checkpoints.load(Ordering::SeqCst), 3);
    assert_eq!(cb.completed.load(Ordering::SeqCst), 1);

    // Rotation keeps the two newest checkpoints.
    assert_eq!(
        summary.checkpoints,
        vec![fx.out.join("checkpoint-4"), fx.out.join("checkpoint-6")]
    );
    assert!(!fx.out.join("checkpoint-2").exists());
    for f in ["adapter_config.json", "adapter_model.safetensors", "trainer_state.json"] {
        assert!(fx.out.join("checkpoint-6").join(f).is_file(), "missing {f}");
    }

    for f in [
        "adapter_config.json",
        "adapter_model.safetensors",
        "training_args.json",
        "trainer_state.json",
        "train_results.json",
        "all_results.json",
    ] {
        assert!(fx.out.join(f).is_file(), "missing {f}");
    }
    let adapter: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fx.out.join("adapter_config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(adapter["r"], 32);
    assert_eq!(adapter["lora_alpha"], 64);
    assert_eq!(
        adapter["target_modules"],
        serde_json::json!(["down_proj", "q_proj", "v_proj"])
    );

    let all: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fx.out.join("all_results.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(all["eval_samples"], 2);

    let state: vlm_sft::checkpoint::TrainerState = serde_json::from_str(
        &std::fs::read_to_string(fx.out.join("trainer_state.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(state.global_step, 6);
    assert_eq!(state.log_history.iter().filter(|e| e.loss.is_some()).count(), 6);
    assert_eq!(state.log_history.iter().filter(|e| e.eval_loss.is_some()).count(), 2);

    let run_dir = fx.tracking.join("medgemma-ecginstruct").join("test-run");
    let metrics = std::fs::read_to_string(run_dir.join("metrics.jsonl")).unwrap();
    assert_eq!(metrics.lines().count(), 8);
    assert!(run_dir.join("summary.json").is_file());
    assert!(run_dir.join("config.json").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn max_steps_caps_the_run_and_final_eval_runs() {
    let fx = Fixture::new(10, 0);
    let config = fx
        .config()
        .eval_samples(2)
        .num_train_epochs(5)
        .per_device_train_batch_size(1)
        .gradient_accumulation_steps(1)
        .max_steps(Some(3))
        .eval_steps(100)
        .save_steps(100)
        .tracking(TrackingMode::Disabled)
        .build()
        .unwrap();

    let mut ex = DryRunExecutor::new();
    let summary = train(&config, &mut ex).await.unwrap();
    assert_eq!(summary.global_step, 3);
    assert_eq!(ex.micro_batches, 3);
    assert!(summary.checkpoints.is_empty());
    assert!(summary.eval_loss.is_some(), "final evaluation after the last step");
    assert!(!fx.tracking.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_images_are_counted_in_the_summary() {
    let fx = Fixture::new(6, 0);
    for i in 0..6 {
        std::fs::remove_file(fx.images.join(format!("ptb-xl/{i:05}_hr.png"))).unwrap();
    }
    let config = fx
        .config()
        .eval_samples(0)
        .num_train_epochs(1)
        .per_device_train_batch_size(2)
        .gradient_accumulation_steps(1)
        .tracking(TrackingMode::Disabled)
        .build()
        .unwrap();

    let mut ex = DryRunExecutor::new();
    let summary = train(&config, &mut ex).await.unwrap();
    assert_eq!(summary.global_step, 3);
    assert_eq!(summary.skipped_samples, 6);
    assert_eq!(summary.placeholder_batches, 3);
    assert_eq!(summary.supervised_tokens, 0);
    assert!(summary.eval_loss.is_none());
}

#[tokio::test]
async fn missing_model_fails_after_dataset() {
    let fx = Fixture::new(4, 0);
    std::fs::remove_dir_all(&fx.model).unwrap();
    let config = fx
        .config()
        .eval_samples(1)
        .tracking(TrackingMode::Disabled)
        .build()
        .unwrap();
    let err = train(&config, &mut DryRunExecutor::new()).await.unwrap_err();
    assert!(matches!(err, TuneError::ModelLoadFailed { .. }), "got {err}");
}
