use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::SamplingParams;
use crate::model::GPTConfig;
use crate::train::TrainConfig;

/// Architecture options a user may set; `vocab_size` comes from the corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub block_size: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub dropout: f32,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            block_size: 256,
            n_embd: 384,
            n_head: 6,
            n_layer: 6,
            dropout: 0.2,
        }
    }
}

impl ModelOptions {
    pub fn with_vocab(&self, vocab_size: usize) -> GPTConfig {
        GPTConfig {
            vocab_size,
            n_embd: self.n_embd,
            n_layer: self.n_layer,
            n_head: self.n_head,
            block_size: self.block_size,
            dropout: self.dropout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleOptions {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: Option<usize>,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 500,
            temperature: 1.0,
            top_k: None,
        }
    }
}

impl SampleOptions {
    pub fn params(&self) -> SamplingParams {
        SamplingParams::new(self.temperature, self.top_k)
    }
}

/// Everything one `train then sample` run needs, loadable from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelOptions,
    pub train: TrainConfig,
    pub sample: SampleOptions,
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }
}
