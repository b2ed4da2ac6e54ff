//! Batch collation: samples → token ids, masks, pixels and labels.
//!
//! A sample whose image cannot be loaded, or whose dialogue does not place
//! exactly one image marker, is skipped with a warning and recorded on the
//! batch. If every sample in a batch fails, a placeholder
//! batch (one black image, empty prompt, all labels ignored) stands in so
//! the step still runs without contributing to the loss.

use crate::error::{SampleError, TuneError};
use crate::pipeline::image::{load_rgb, placeholder_image, resolve_image_path};
use crate::pipeline::messages::{normalize, ContentPart, Message, Role, Sample};
use crate::pipeline::processor::{PixelValues, Processor};
use crate::progress::ProgressCallback;
use image::RgbImage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Whether a batch holds real samples or the all-failed stand-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Samples,
    Placeholder,
}

/// One collated micro-batch. Every per-row vector has the same length.
#[derive(Debug, Clone)]
pub struct Batch {
    pub kind: BatchKind,
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
    pub token_type_ids: Vec<Vec<u32>>,
    pub pixel_values: PixelValues,
    pub labels: Vec<Vec<i64>>,
    /// Samples dropped while building this batch.
    pub skipped: Vec<SampleError>,
}

impl Batch {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == BatchKind::Placeholder
    }

    /// Label positions that contribute to the loss.
    pub fn supervised_tokens(&self) -> usize {
        self.labels
            .iter()
            .flatten()
            .filter(|&&l| l != IGNORE_INDEX)
            .count()
    }
}

/// Copy `input_ids` into labels, replacing every id in `masked` with
/// [`IGNORE_INDEX`].
pub fn derive_labels(input_ids: &[Vec<u32>], masked: &[u32]) -> Vec<Vec<i64>> {
    input_ids
        .iter()
        .map(|row| {
            row.iter()
                .map(|&id| {
                    if masked.contains(&id) {
                        IGNORE_INDEX
                    } else {
                        i64::from(id)
                    }
                })
                .collect()
        })
        .collect()
}

/// Turns lists of samples into [`Batch`]es.
///
/// Holds no mutable state, so one collator is shared across the blocking
/// pool via `Arc`.
pub struct Collator {
    processor: Arc<Processor>,
    image_folder: PathBuf,
    masked_ids: Vec<u32>,
    progress: Option<ProgressCallback>,
}

impl Collator {
    pub fn new(processor: Arc<Processor>, image_folder: impl Into<PathBuf>) -> Self {
        let masked_ids = processor.label_mask_ids();
        Self {
            processor,
            image_folder: image_folder.into(),
            masked_ids,
            progress: None,
        }
    }

    /// Report skipped samples to a progress callback as well as the log.
    pub fn with_progress(mut self, cb: Option<ProgressCallback>) -> Self {
        self.progress = cb;
        self
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// Collate `samples` into one batch.
    ///
    /// Per-sample failures never fail the call; only tokenizer errors do.
    pub fn collate(&self, samples: &[Sample]) -> Result<Batch, TuneError> {
        let mut texts = Vec::with_capacity(samples.len());
        let mut images: Vec<RgbImage> = Vec::with_capacity(samples.len());
        let mut skipped = Vec::new();

        for (index, sample) in samples.iter().enumerate() {
            match self.prepare_sample(index, sample) {
                Ok((text, img)) => {
                    texts.push(text);
                    images.push(img);
                }
                Err(e) => {
                    warn!("Skipping sample: {}", e);
                    if let Some(cb) = &self.progress {
                        cb.on_sample_skipped(&e.to_string());
                    }
                    skipped.push(e);
                }
            }
        }

        if images.is_empty() {
            return self.placeholder(skipped);
        }

        let encoded = self.processor.encode(&texts, &images)?;
        let labels = derive_labels(&encoded.input_ids, &self.masked_ids);
        debug!(
            "Collated {} samples ({} skipped), seq len {}",
            encoded.input_ids.len(),
            skipped.len(),
            encoded.input_ids.first().map(Vec::len).unwrap_or(0)
        );

        Ok(Batch {
            kind: BatchKind::Samples,
            input_ids: encoded.input_ids,
            attention_mask: encoded.attention_mask,
            token_type_ids: encoded.token_type_ids,
            pixel_values: encoded.pixel_values,
            labels,
            skipped,
        })
    }

    /// Render one sample and load its image.
    ///
    /// The dialogue is checked first so an image no token would refer to is
    /// never read from disk.
    fn prepare_sample(&self, index: usize, sample: &Sample) -> Result<(String, RgbImage), SampleError> {
        let messages = normalize(sample);
        let markers: usize = messages.iter().map(Message::image_count).sum();
        if markers != 1 {
            return Err(SampleError::ImageMarkerMismatch { index, markers });
        }

        let path = resolve_image_path(&sample.image, &self.image_folder);
        let img = load_rgb(&path, index)?;
        let config = self.processor.image_config();
        if !config.accepts(&img) {
            let (width, height) = img.dimensions();
            return Err(SampleError::ImageSizeMismatch {
                index,
                path,
                width,
                height,
                expected_width: config.width,
                expected_height: config.height,
            });
        }
        Ok((self.processor.render(&messages), img))
    }

    /// The stand-in batch used when no sample in a batch had a loadable image.
    fn placeholder(&self, skipped: Vec<SampleError>) -> Result<Batch, TuneError> {
        warn!(
            "All {} samples in batch failed to load, using placeholder batch",
            skipped.len()
        );
        let messages = vec![Message {
            role: Role::User,
            content: vec![ContentPart::Image, ContentPart::text("")],
        }];
        let text = self.processor.render(&messages);
        let config = self.processor.image_config();
        let mut image = placeholder_image();
        if !config.accepts(&image) {
            image = RgbImage::new(config.width, config.height);
        }
        let encoded = self.processor.encode(&[text], &[image])?;
        let labels = encoded
            .input_ids
            .iter()
            .map(|row| vec![IGNORE_INDEX; row.len()])
            .collect();

        Ok(Batch {
            kind: BatchKind::Placeholder,
            input_ids: encoded.input_ids,
            attention_mask: encoded.attention_mask,
            token_type_ids: encoded.token_type_ids,
            pixel_values: encoded.pixel_values,
            labels,
            skipped,
        })
    }
}
