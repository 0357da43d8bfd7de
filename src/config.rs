use std::{fs, path::Path};

use anyhow::{Context, Result, anyhow, bail, ensure};
use burn::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};

use crate::model::TransformerConfig;

fn default_true() -> bool {
    true
}

fn default_max_seq_len() -> usize {
    100
}

fn default_batch_size() -> usize {
    16
}

fn default_num_workers() -> usize {
    4
}

fn default_src_column() -> String {
    "src".into()
}

fn default_tgt_column() -> String {
    "tgt".into()
}

fn default_pad_token() -> String {
    "<pad>".into()
}

fn default_sos_token() -> String {
    "<s>".into()
}

fn default_eos_token() -> String {
    "</s>".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    /// Path to a `tokenizer.json`, or a Hugging Face hub model id.
    pub tokenizer: String,
    pub train: String,
    pub dev: String,
    #[serde(default = "default_src_column")]
    pub src_column: String,
    #[serde(default = "default_tgt_column")]
    pub tgt_column: String,
    #[serde(default = "default_max_seq_len")]
    pub max_src_len: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_tgt_len: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default = "default_pad_token")]
    pub pad_token: String,
    #[serde(default = "default_sos_token")]
    pub sos_token: String,
    #[serde(default = "default_eos_token")]
    pub eos_token: String,
}

/// The `model` section as written in YAML; missing keys take the defaults of
/// [`TransformerConfig`].
#[derive(Deserialize)]
struct ModelSection {
    src_vocab_size: usize,
    tgt_vocab_size: usize,
    max_len: Option<usize>,
    d_model: Option<usize>,
    n_heads: Option<usize>,
    d_ff: Option<usize>,
    num_enc_blocks: Option<usize>,
    num_dec_blocks: Option<usize>,
    dropout: Option<f64>,
    pad_id: Option<usize>,
}

impl From<ModelSection> for TransformerConfig {
    fn from(section: ModelSection) -> Self {
        let base = TransformerConfig::new(section.src_vocab_size, section.tgt_vocab_size);

        Self {
            max_len: section.max_len.unwrap_or(base.max_len),
            d_model: section.d_model.unwrap_or(base.d_model),
            n_heads: section.n_heads.unwrap_or(base.n_heads),
            d_ff: section.d_ff.unwrap_or(base.d_ff),
            num_enc_blocks: section.num_enc_blocks.unwrap_or(base.num_enc_blocks),
            num_dec_blocks: section.num_dec_blocks.unwrap_or(base.num_dec_blocks),
            dropout: section.dropout.unwrap_or(base.dropout),
            pad_id: section.pad_id.unwrap_or(base.pad_id),
            ..base
        }
    }
}

fn model_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TransformerConfig, D::Error> {
    ModelSection::deserialize(deserializer).map(TransformerConfig::from)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub n_warmup_steps: usize,
    pub lr_factor: f64,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            n_warmup_steps: 4000,
            lr_factor: 1.0,
            beta_1: 0.9,
            beta_2: 0.98,
            epsilon: 1e-9,
        }
    }
}

fn default_epochs() -> usize {
    10
}

fn default_seed() -> u64 {
    1234
}

fn default_show_interval() -> usize {
    100
}

fn default_save_model() -> String {
    "./exp/transformer".into()
}

fn default_exp_dir() -> String {
    "./exp".into()
}

fn default_grad_accum_steps() -> usize {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingSettings {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub use_gpu: bool,
    pub num_gpu: usize,
    pub gpu_ids: String,
    #[serde(default = "default_show_interval")]
    pub show_interval: usize,
    #[serde(default = "default_true")]
    pub dev_on_training: bool,
    /// Checkpoint path prefix, `<save_model>.epoch<N>.chkpt` per epoch.
    #[serde(default = "default_save_model")]
    pub save_model: String,
    #[serde(default)]
    pub visualization: bool,
    #[serde(default = "default_exp_dir")]
    pub exp_dir: String,
    #[serde(default = "default_grad_accum_steps")]
    pub grad_accum_steps: usize,
}

impl TrainingSettings {
    pub fn multi_gpu(&self) -> bool {
        self.num_gpu >= 1
    }

    /// Parses `gpu_ids` and checks it agrees with `num_gpu`.
    pub fn device_ids(&self) -> Result<Vec<usize>> {
        let ids = self
            .gpu_ids
            .split(',')
            .map(|id| {
                id.trim()
                    .parse::<usize>()
                    .map_err(|e| anyhow!("Invalid device id {:?} in gpu_ids: {e}", id.trim()))
            })
            .collect::<Result<Vec<_>>>()?;

        ensure!(
            ids.len() == self.num_gpu,
            "gpu_ids lists {} devices but num_gpu is {}",
            ids.len(),
            self.num_gpu
        );

        Ok(ids)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainConfig {
    pub data: DataConfig,
    #[serde(deserialize_with = "model_section")]
    pub model: TransformerConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    pub training: TrainingSettings,
}

impl Config for TrainConfig {}

impl TrainConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Malformed YAML configuration")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.training.show_interval == 0 {
            bail!("training.show_interval must be at least 1");
        }
        if self.training.epochs == 0 {
            bail!("training.epochs must be at least 1");
        }
        if self.training.grad_accum_steps == 0 {
            bail!("training.grad_accum_steps must be at least 1");
        }
        if self.data.batch_size == 0 {
            bail!("data.batch_size must be at least 1");
        }
        self.model.validate()
    }
}

pub fn load(path: impl AsRef<Path>) -> Result<TrainConfig> {
    let path = path.as_ref();
    let yaml = fs::read_to_string(path)
        .with_context(|| format!("Could not open config {}", path.display()))?;

    TrainConfig::from_yaml_str(&yaml)
        .with_context(|| format!("Bad configuration in {}", path.display()))
}
