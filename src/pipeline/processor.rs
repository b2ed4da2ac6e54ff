//! Text + image processor: chat rendering, image-token expansion,
//! tokenization, truncation, padding and pixel preprocessing.
//!
//! Loaded from the model directory:
//!
//! | File | Used for |
//! |------|----------|
//! | `tokenizer.json` | vocabulary and tokenization (required) |
//! | `tokenizer_config.json` | special token strings (optional) |
//! | `preprocessor_config.json` | image size, mean, std (optional) |
//! | `processor_config.json` | image sequence length (optional) |
//!
//! Padding is always applied on the right, whatever the tokenizer config
//! says, so labels line up with the text from position 0.

use crate::error::TuneError;
use crate::pipeline::image::ImageProcessorConfig;
use crate::pipeline::messages::Message;
use crate::pipeline::template::{ChatTemplate, TemplateTokens};
use image::RgbImage;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Image tokens per image when `processor_config.json` doesn't say.
pub const DEFAULT_IMAGE_SEQ_LENGTH: usize = 256;

/// Knobs the processor takes from the run configuration.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub max_seq_length: usize,
    pub chat_template: ChatTemplate,
    /// Token strings to mask from labels; unknown strings are skipped.
    pub reserved_tokens: Vec<String>,
    pub reserved_token_ids: Vec<u32>,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_seq_length: 2048,
            chat_template: ChatTemplate::default(),
            reserved_tokens: vec!["<image_soft_token>".to_string()],
            reserved_token_ids: Vec::new(),
        }
    }
}

impl From<&crate::config::TrainingConfig> for ProcessorOptions {
    fn from(c: &crate::config::TrainingConfig) -> Self {
        Self {
            max_seq_length: c.max_seq_length,
            chat_template: c.chat_template,
            reserved_tokens: c.reserved_tokens.clone(),
            reserved_token_ids: c.reserved_token_ids.clone(),
        }
    }
}

/// Special token strings, from `tokenizer_config.json` or Gemma defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialTokens {
    pub pad: String,
    pub bos: String,
    pub eos: String,
    /// Begin-of-image marker; one per image in the rendered chat text.
    pub boi: String,
    pub eoi: String,
    /// Soft token repeated `image_seq_length` times per image.
    pub image: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad: "<pad>".into(),
            bos: "<bos>".into(),
            eos: "<eos>".into(),
            boi: "<start_of_image>".into(),
            eoi: "<end_of_image>".into(),
            image: "<image_soft_token>".into(),
        }
    }
}

/// A token entry in `tokenizer_config.json`: either a bare string or an
/// added-token object with a `content` field.
#[derive(Deserialize)]
#[serde(untagged)]
enum TokenEntry {
    Plain(String),
    Added { content: String },
}

impl TokenEntry {
    fn into_string(self) -> String {
        match self {
            TokenEntry::Plain(s) | TokenEntry::Added { content: s } => s,
        }
    }
}

#[derive(Deserialize, Default)]
struct RawTokenizerConfig {
    pad_token: Option<TokenEntry>,
    bos_token: Option<TokenEntry>,
    eos_token: Option<TokenEntry>,
    boi_token: Option<TokenEntry>,
    eoi_token: Option<TokenEntry>,
    image_token: Option<TokenEntry>,
    padding_side: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawProcessorConfig {
    image_seq_length: Option<usize>,
}

/// Channel-first pixel data for a whole batch: `shape = [n, 3, H, W]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelValues {
    pub data: Vec<f32>,
    pub shape: [usize; 4],
}

/// Token and pixel tensors for a batch, before labels are derived.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
    pub token_type_ids: Vec<Vec<u32>>,
    pub pixel_values: PixelValues,
}

/// Tokenizer, special token ids and image preprocessing for one model.
pub struct Processor {
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    template: ChatTemplate,
    image_config: ImageProcessorConfig,
    image_seq_length: usize,
    max_seq_length: usize,
    pad_id: u32,
    boi_id: u32,
    image_token_id: u32,
    reserved_ids: Vec<u32>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("tokens", &self.tokens)
            .field("template", &self.template)
            .field("image_seq_length", &self.image_seq_length)
            .field("max_seq_length", &self.max_seq_length)
            .field("pad_id", &self.pad_id)
            .field("boi_id", &self.boi_id)
            .field("reserved_ids", &self.reserved_ids)
            .finish_non_exhaustive()
    }
}

fn read_optional_json<T: for<'de> Deserialize<'de> + Default>(
    dir: &Path,
    name: &str,
) -> Result<T, TuneError> {
    let path = dir.join(name);
    if !path.exists() {
        debug!("{} absent, using defaults", name);
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(&path).map_err(|e| load_failed(dir, format!("{name}: {e}")))?;
    serde_json::from_str(&text).map_err(|e| load_failed(dir, format!("{name}: {e}")))
}

fn load_failed(dir: &Path, detail: impl Into<String>) -> TuneError {
    TuneError::ProcessorLoadFailed {
        path: dir.to_path_buf(),
        detail: detail.into(),
    }
}

impl Processor {
    /// Load the processor files from a model directory.
    pub fn from_pretrained(dir: &Path, opts: &ProcessorOptions) -> Result<Self, TuneError> {
        let path = tokenizer_path(dir);
        if !path.is_file() {
            return Err(load_failed(dir, "tokenizer.json not found"));
        }
        let tokenizer = Tokenizer::from_file(&path)
            .map_err(|e| load_failed(dir, format!("tokenizer.json: {e}")))?;

        let raw: RawTokenizerConfig = read_optional_json(dir, "tokenizer_config.json")?;
        if let Some(side) = raw.padding_side.as_deref() {
            if side != "right" {
                debug!("tokenizer_config padding_side '{}' overridden to right", side);
            }
        }
        let d = SpecialTokens::default();
        let tokens = SpecialTokens {
            pad: raw.pad_token.map(TokenEntry::into_string).unwrap_or(d.pad),
            bos: raw.bos_token.map(TokenEntry::into_string).unwrap_or(d.bos),
            eos: raw.eos_token.map(TokenEntry::into_string).unwrap_or(d.eos),
            boi: raw.boi_token.map(TokenEntry::into_string).unwrap_or(d.boi),
            eoi: raw.eoi_token.map(TokenEntry::into_string).unwrap_or(d.eoi),
            image: raw.image_token.map(TokenEntry::into_string).unwrap_or(d.image),
        };

        let image_config = {
            let path = dir.join("preprocessor_config.json");
            if path.exists() {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| load_failed(dir, format!("preprocessor_config.json: {e}")))?;
                ImageProcessorConfig::from_json_str(&text)
                    .map_err(|e| load_failed(dir, format!("preprocessor_config.json: {e}")))?
            } else {
                debug!("preprocessor_config.json absent, using defaults");
                ImageProcessorConfig::default()
            }
        };

        let proc_cfg: RawProcessorConfig = read_optional_json(dir, "processor_config.json")?;
        let image_seq_length = proc_cfg.image_seq_length.unwrap_or(DEFAULT_IMAGE_SEQ_LENGTH);

        let processor = Self::new(tokenizer, tokens, image_config, image_seq_length, opts)?;
        info!(
            "Processor loaded: vocab={}, image tokens/image={}, image size={}x{}",
            processor.tokenizer.get_vocab_size(true),
            processor.image_seq_length,
            processor.image_config.width,
            processor.image_config.height
        );
        Ok(processor)
    }

    /// Assemble a processor from already-loaded parts.
    pub fn new(
        mut tokenizer: Tokenizer,
        tokens: SpecialTokens,
        image_config: ImageProcessorConfig,
        image_seq_length: usize,
        opts: &ProcessorOptions,
    ) -> Result<Self, TuneError> {
        // Padding and truncation are applied here, never by the tokenizer.
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(None)
            .map_err(|e| TuneError::Tokenization(e.to_string()))?;

        let require = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| TuneError::MissingSpecialToken {
                    token: token.to_string(),
                })
        };
        let pad_id = require(&tokens.pad)?;
        let boi_id = require(&tokens.boi)?;
        let image_token_id = require(&tokens.image)?;

        let mut reserved_ids = Vec::new();
        for name in &opts.reserved_tokens {
            match tokenizer.token_to_id(name) {
                Some(id) => reserved_ids.push(id),
                None => warn!("Reserved token '{}' not in vocabulary, not masked", name),
            }
        }
        reserved_ids.extend(opts.reserved_token_ids.iter().copied());
        reserved_ids.sort_unstable();
        reserved_ids.dedup();

        Ok(Self {
            tokenizer,
            tokens,
            template: opts.chat_template,
            image_config,
            image_seq_length,
            max_seq_length: opts.max_seq_length,
            pad_id,
            boi_id,
            image_token_id,
            reserved_ids,
        })
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Id of the begin-of-image marker, the image placeholder masked in labels.
    pub fn image_placeholder_id(&self) -> u32 {
        self.boi_id
    }

    pub fn image_token_id(&self) -> u32 {
        self.image_token_id
    }

    pub fn reserved_ids(&self) -> &[u32] {
        &self.reserved_ids
    }

    pub fn tokens(&self) -> &SpecialTokens {
        &self.tokens
    }

    pub fn image_config(&self) -> &ImageProcessorConfig {
        &self.image_config
    }

    /// Every id that becomes the ignore sentinel in labels: padding, the
    /// image placeholder and the reserved ids.
    pub fn label_mask_ids(&self) -> Vec<u32> {
        let mut ids = vec![self.pad_id, self.boi_id];
        ids.extend_from_slice(&self.reserved_ids);
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Render messages with the chat template, without a generation prompt.
    pub fn render(&self, messages: &[Message]) -> String {
        let tokens = TemplateTokens {
            bos: self.tokens.bos.clone(),
            image_marker: self.tokens.boi.clone(),
        };
        self.template.render(messages, &tokens, false)
    }

    /// Replace each image marker with the model's full image token run.
    pub fn expand_image_markers(&self, text: &str) -> String {
        let run = format!(
            "\n\n{}{}{}\n\n",
            self.tokens.boi,
            self.tokens.image.repeat(self.image_seq_length),
            self.tokens.eoi
        );
        text.replace(&self.tokens.boi, &run)
    }

    /// Tokenize one rendered text: expand markers, encode, truncate.
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>, TuneError> {
        let expanded = self.expand_image_markers(text);
        let encoding = self
            .tokenizer
            .encode(expanded.as_str(), false)
            .map_err(|e| TuneError::Tokenization(e.to_string()))?;
        let mut ids = encoding.get_ids().to_vec();

        if ids.len() > self.max_seq_length {
            let expected_image_tokens =
                text.matches(self.tokens.boi.as_str()).count() * self.image_seq_length;
            ids.truncate(self.max_seq_length);
            let kept = ids.iter().filter(|&&id| id == self.image_token_id).count();
            if kept < expected_image_tokens {
                warn!(
                    "Truncation to {} tokens cut {} image tokens",
                    self.max_seq_length,
                    expected_image_tokens - kept
                );
            } else {
                debug!("Sequence truncated to {} tokens", self.max_seq_length);
            }
        }
        Ok(ids)
    }

    /// Tokenize and right-pad a batch of texts and preprocess its images.
    pub fn encode(&self, texts: &[String], images: &[RgbImage]) -> Result<Encoded, TuneError> {
        let mut input_ids = texts
            .iter()
            .map(|t| self.tokenize(t))
            .collect::<Result<Vec<_>, _>>()?;
        let longest = input_ids.iter().map(Vec::len).max().unwrap_or(0);

        let mut attention_mask = Vec::with_capacity(input_ids.len());
        let mut token_type_ids = Vec::with_capacity(input_ids.len());
        for ids in &mut input_ids {
            let real = ids.len();
            ids.resize(longest, self.pad_id);
            let mut mask = vec![1u32; real];
            mask.resize(longest, 0);
            attention_mask.push(mask);
            token_type_ids.push(
                ids.iter()
                    .map(|&id| u32::from(id == self.image_token_id))
                    .collect(),
            );
        }

        let [c, h, w] = self.image_config.output_shape();
        let mut data = Vec::with_capacity(images.len() * c * h * w);
        for img in images {
            data.extend(self.image_config.preprocess(img)?);
        }
        let pixel_values = PixelValues {
            data,
            shape: [images.len(), c, h, w],
        };

        Ok(Encoded {
            input_ids,
            attention_mask,
            token_type_ids,
            pixel_values,
        })
    }
}

/// Path of the tokenizer file inside a model directory.
pub fn tokenizer_path(model_dir: &Path) -> PathBuf {
    model_dir.join("tokenizer.json")
}
