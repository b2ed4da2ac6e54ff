//! Pretrained model index: `config.json` plus the tensor table of every
//! safetensors shard.
//!
//! Only shard headers are read (an 8-byte little-endian length followed by
//! a JSON table); the weight bytes themselves stay on disk for the step
//! executor to map. That is enough to pick LoRA targets and count
//! parameters.

use crate::error::TuneError;
use safetensors::tensor::TensorInfo;
use safetensors::Dtype;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Numeric format the base weights are loaded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Bf16,
    F16,
    F32,
}

impl Precision {
    pub fn dtype(&self) -> Dtype {
        match self {
            Precision::Bf16 => Dtype::BF16,
            Precision::F16 => Dtype::F16,
            Precision::F32 => Dtype::F32,
        }
    }
}

/// The fields of `config.json` the pipeline reads; everything else is kept
/// verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub torch_dtype: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One tensor in the weight index.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightInfo {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    /// Shard file holding this tensor.
    pub shard: PathBuf,
}

impl WeightInfo {
    pub fn numel(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }

    /// A linear layer's weight: 2-D and named `*.weight`.
    pub fn is_linear(&self) -> bool {
        self.shape.len() == 2 && self.name.ends_with(".weight")
    }

    /// Module path, i.e. the tensor name without its `.weight` suffix.
    pub fn module_name(&self) -> &str {
        self.name.strip_suffix(".weight").unwrap_or(&self.name)
    }
}

/// A pretrained checkpoint on local disk.
#[derive(Debug, Clone)]
pub struct PretrainedModel {
    pub dir: PathBuf,
    pub config: ModelConfig,
    /// Sorted by tensor name.
    pub weights: Vec<WeightInfo>,
    pub precision: Precision,
}

fn load_failed(dir: &Path, detail: impl Into<String>) -> TuneError {
    TuneError::ModelLoadFailed {
        path: dir.to_path_buf(),
        detail: detail.into(),
    }
}

/// Read the tensor table from one safetensors file without touching the data.
pub fn read_shard_header(path: &Path) -> Result<Vec<(String, TensorInfo)>, String> {
    let mut file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .map_err(|e| format!("header length: {e}"))?;
    let len = u64::from_le_bytes(len_bytes);
    // Headers are JSON tables of names and offsets; anything this large is corrupt.
    if len > 100 * 1024 * 1024 {
        return Err(format!("header length {len} is implausible"));
    }
    let mut header = vec![0u8; len as usize];
    file.read_exact(&mut header)
        .map_err(|e| format!("header body: {e}"))?;

    let table: HashMap<String, serde_json::Value> =
        serde_json::from_slice(&header).map_err(|e| format!("header JSON: {e}"))?;
    let mut tensors = Vec::with_capacity(table.len());
    for (name, value) in table {
        if name == "__metadata__" {
            continue;
        }
        let info: TensorInfo =
            serde_json::from_value(value).map_err(|e| format!("tensor '{name}': {e}"))?;
        tensors.push((name, info));
    }
    Ok(tensors)
}

impl PretrainedModel {
    /// Index the checkpoint in `dir`.
    ///
    /// Requires `config.json` and at least one `*.safetensors` shard at the
    /// top level of the directory.
    pub fn load(dir: &Path, precision: Precision) -> Result<Self, TuneError> {
        if !dir.is_dir() {
            return Err(load_failed(dir, "model directory does not exist"));
        }

        let config_path = dir.join("config.json");
        let text = std::fs::read_to_string(&config_path)
            .map_err(|e| load_failed(dir, format!("config.json: {e}")))?;
        let config: ModelConfig = serde_json::from_str(&text)
            .map_err(|e| load_failed(dir, format!("config.json: {e}")))?;

        let mut shards: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| load_failed(dir, e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("safetensors"))
            .collect();
        shards.sort();
        if shards.is_empty() {
            return Err(load_failed(dir, "no *.safetensors weight files"));
        }

        let target = precision.dtype();
        let mut weights = Vec::new();
        for shard in &shards {
            let tensors = read_shard_header(shard).map_err(|e| {
                load_failed(dir, format!("{}: {}", shard.display(), e))
            })?;
            debug!("{}: {} tensors", shard.display(), tensors.len());
            for (name, info) in tensors {
                if info.dtype != target {
                    debug!("{} stored as {:?}, will be cast to {:?}", name, info.dtype, target);
                }
                weights.push(WeightInfo {
                    name,
                    dtype: info.dtype,
                    shape: info.shape,
                    shard: shard.clone(),
                });
            }
        }
        weights.sort_by(|a, b| a.name.cmp(&b.name));

        let model = Self {
            dir: dir.to_path_buf(),
            config,
            weights,
            precision,
        };
        info!(
            "Loaded {} ({}): {} tensors in {} shard(s), {} parameters, {:?}",
            dir.display(),
            model.config.architectures.first().map(String::as_str).unwrap_or("unknown"),
            model.weights.len(),
            shards.len(),
            model.parameter_count(),
            precision
        );
        Ok(model)
    }

    /// Total base-model parameters.
    pub fn parameter_count(&self) -> u64 {
        self.weights.iter().map(WeightInfo::numel).sum()
    }

    pub fn linear_weights(&self) -> impl Iterator<Item = &WeightInfo> {
        self.weights.iter().filter(|w| w.is_linear())
    }
}

/// Accelerator details reported by the step executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub name: String,
    /// `(major, minor)` compute capability.
    pub compute_capability: (u32, u32),
}

/// Minimum compute capability major version with native bf16.
pub const BF16_MIN_MAJOR: u32 = 8;

/// Warn when the accelerator predates native bf16. Returns `false` then.
pub fn check_accelerator(info: &AcceleratorInfo) -> bool {
    let (major, minor) = info.compute_capability;
    if major < BF16_MIN_MAJOR {
        warn!(
            "{} has compute capability {}.{}; bf16 training is not optimal below {}.0",
            info.name, major, minor, BF16_MIN_MAJOR
        );
        return false;
    }
    debug!("Accelerator {} (compute {}.{})", info.name, major, minor);
    true
}
