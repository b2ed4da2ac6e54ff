//! Low-rank adapters: target selection, initialisation and export.
//!
//! Each targeted linear weight `W: [out, in]` gets a pair `A: [r, in]`,
//! `B: [out, r]` so the adapted layer computes `W x + (alpha / r) B A x`.
//! `A` starts uniform in `±1/√in`, `B` starts at zero, so the adapted model
//! is initially identical to the base. Base weights are frozen; only
//! adapter weights are trainable.

use crate::config::TrainingConfig;
use crate::error::TuneError;
use crate::model::PretrainedModel;
use crate::output::write_json_atomic;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Which linear modules receive an adapter.
///
/// Serialised the way adapter configs spell it: the string `"all-linear"`,
/// a list of module names, or any other string as a regular expression.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "TargetModulesRepr", into = "TargetModulesRepr")]
pub enum TargetModules {
    /// Every linear layer except embeddings and the output head.
    #[default]
    AllLinear,
    /// Modules whose path equals, or ends with `.` + , one of these names.
    Names(Vec<String>),
    /// Modules whose full path matches this expression.
    Pattern(String),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TargetModulesRepr {
    One(String),
    Many(Vec<String>),
}

impl From<TargetModulesRepr> for TargetModules {
    fn from(r: TargetModulesRepr) -> Self {
        match r {
            TargetModulesRepr::One(s) if s == "all-linear" => TargetModules::AllLinear,
            TargetModulesRepr::One(s) => TargetModules::Pattern(s),
            TargetModulesRepr::Many(v) => TargetModules::Names(v),
        }
    }
}

impl From<TargetModules> for TargetModulesRepr {
    fn from(t: TargetModules) -> Self {
        match t {
            TargetModules::AllLinear => TargetModulesRepr::One("all-linear".into()),
            TargetModules::Pattern(p) => TargetModulesRepr::One(p),
            TargetModules::Names(v) => TargetModulesRepr::Many(v),
        }
    }
}

impl std::str::FromStr for TargetModules {
    type Err = std::convert::Infallible;

    /// `all-linear`, a comma-separated name list, or `re:<pattern>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(if s == "all-linear" {
            TargetModules::AllLinear
        } else if let Some(p) = s.strip_prefix("re:") {
            TargetModules::Pattern(p.to_string())
        } else {
            TargetModules::Names(
                s.split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(String::from)
                    .collect(),
            )
        })
    }
}

enum Matcher<'a> {
    AllLinear,
    Names(&'a [String]),
    Pattern(Regex),
}

impl Matcher<'_> {
    fn matches(&self, module: &str) -> bool {
        match self {
            Matcher::AllLinear => {
                let leaf = module.rsplit('.').next().unwrap_or(module);
                !module.contains("embed") && leaf != "lm_head"
            }
            Matcher::Names(names) => names.iter().any(|n| {
                module == n || (module.ends_with(n.as_str()) && module[..module.len() - n.len()].ends_with('.'))
            }),
            Matcher::Pattern(re) => re.is_match(module),
        }
    }
}

/// Adapter hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub alpha: u32,
    pub dropout: f32,
    pub target_modules: TargetModules,
    pub bias: String,
    pub task_type: String,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 32,
            alpha: 64,
            dropout: 0.05,
            target_modules: TargetModules::AllLinear,
            bias: "none".into(),
            task_type: "CAUSAL_LM".into(),
        }
    }
}

impl From<&TrainingConfig> for LoraConfig {
    fn from(c: &TrainingConfig) -> Self {
        Self {
            r: c.lora_r,
            alpha: c.lora_alpha,
            dropout: c.lora_dropout,
            target_modules: c.target_modules.clone(),
            ..Default::default()
        }
    }
}

impl LoraConfig {
    /// Multiplier applied to the adapter path.
    pub fn scaling(&self) -> f32 {
        self.alpha as f32 / self.r as f32
    }
}

/// One adapter pair, row-major.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Module path of the adapted linear layer.
    pub module: String,
    pub in_features: usize,
    pub out_features: usize,
    /// `[r, in_features]`
    pub a: Vec<f32>,
    /// `[out_features, r]`
    pub b: Vec<f32>,
}

impl LoraAdapter {
    pub fn parameter_count(&self) -> u64 {
        (self.a.len() + self.b.len()) as u64
    }
}

/// A base model with adapters attached.
#[derive(Debug, Clone)]
pub struct AdaptedModel {
    pub base: PretrainedModel,
    pub lora: LoraConfig,
    pub adapters: Vec<LoraAdapter>,
}

/// Counts reported after adapters are attached.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterCounts {
    pub trainable: u64,
    pub all: u64,
}

impl ParameterCounts {
    pub fn trainable_percent(&self) -> f64 {
        if self.all == 0 {
            return 0.0;
        }
        100.0 * self.trainable as f64 / self.all as f64
    }
}

impl std::fmt::Display for ParameterCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.all,
            self.trainable_percent()
        )
    }
}

/// Attach adapters to every matching linear weight of `model`.
pub fn attach_lora(
    model: PretrainedModel,
    lora: &LoraConfig,
    seed: u64,
) -> Result<AdaptedModel, TuneError> {
    if lora.r == 0 {
        return Err(TuneError::InvalidConfig("LoRA rank must be ≥ 1".into()));
    }
    let matcher = match &lora.target_modules {
        TargetModules::AllLinear => Matcher::AllLinear,
        TargetModules::Names(names) => Matcher::Names(names),
        TargetModules::Pattern(p) => Matcher::Pattern(
            Regex::new(&format!("^(?:{p})$"))
                .map_err(|e| TuneError::InvalidConfig(format!("target module pattern '{p}': {e}")))?,
        ),
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let mut adapters = Vec::new();
    for weight in model.linear_weights() {
        let module = weight.module_name();
        if !matcher.matches(module) {
            continue;
        }
        let (out_features, in_features) = (weight.shape[0], weight.shape[1]);
        let bound = 1.0 / (in_features as f32).sqrt();
        let a = (0..lora.r * in_features)
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();
        let b = vec![0.0; out_features * lora.r];
        debug!("LoRA target {} [{}x{}]", module, out_features, in_features);
        adapters.push(LoraAdapter {
            module: module.to_string(),
            in_features,
            out_features,
            a,
            b,
        });
    }

    if adapters.is_empty() {
        return Err(TuneError::InvalidConfig(format!(
            "no linear modules matched target_modules {:?}",
            lora.target_modules
        )));
    }

    let adapted = AdaptedModel {
        base: model,
        lora: lora.clone(),
        adapters,
    };
    info!(
        "Attached {} adapters (r={}, alpha={})",
        adapted.adapters.len(),
        lora.r,
        lora.alpha
    );
    info!("{}", adapted.parameter_counts());
    Ok(adapted)
}

impl AdaptedModel {
    pub fn parameter_counts(&self) -> ParameterCounts {
        let trainable: u64 = self.adapters.iter().map(LoraAdapter::parameter_count).sum();
        ParameterCounts {
            trainable,
            all: self.base.parameter_count() + trainable,
        }
    }

    /// Leaf names of the adapted modules, deduplicated and sorted.
    pub fn target_leaf_names(&self) -> Vec<String> {
        self.adapters
            .iter()
            .map(|a| a.module.rsplit('.').next().unwrap_or(&a.module).to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Write `adapter_config.json` and `adapter_model.safetensors` to `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<(), TuneError> {
        std::fs::create_dir_all(dir).map_err(|e| TuneError::write(dir, e))?;

        let config = serde_json::json!({
            "peft_type": "LORA",
            "task_type": self.lora.task_type,
            "r": self.lora.r,
            "lora_alpha": self.lora.alpha,
            "lora_dropout": self.lora.dropout,
            "bias": self.lora.bias,
            "target_modules": self.target_leaf_names(),
            "base_model_name_or_path": self.base.dir,
            "inference_mode": true,
        });
        write_json_atomic(&dir.join("adapter_config.json"), &config)?;

        let r = self.lora.r;
        let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(self.adapters.len() * 2);
        for adapter in &self.adapters {
            buffers.push((
                format!("base_model.model.{}.lora_A.weight", adapter.module),
                vec![r, adapter.in_features],
                f32_bytes(&adapter.a),
            ));
            buffers.push((
                format!("base_model.model.{}.lora_B.weight", adapter.module),
                vec![adapter.out_features, r],
                f32_bytes(&adapter.b),
            ));
        }
        let views = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (name.clone(), view))
                    .map_err(|e| TuneError::Internal(format!("adapter tensor {name}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let path = dir.join("adapter_model.safetensors");
        safetensors::serialize_to_file(views, &None, &path)
            .map_err(|e| TuneError::write(&path, std::io::Error::other(e.to_string())))?;
        info!("Saved adapter ({} tensors) to {}", buffers.len(), dir.display());
        Ok(())
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
