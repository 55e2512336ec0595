use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module, ModuleT};
use serde::{Deserialize, Serialize};

use super::attention::Block;
use super::loss::{cross_entropy_loss, LossReduction};
use super::ops::LayerNorm;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GPTConfig {
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,

    // max context window
    pub block_size: usize,
    pub dropout: f32,
}

impl GPTConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.vocab_size > 0, "config.vocab_size must be > 0");
        ensure!(self.block_size > 0, "config.block_size must be > 0");
        ensure!(self.n_layer > 0, "config must have at least one layer");
        ensure!(self.n_head > 0, "config.n_head must be > 0");
        ensure!(
            self.n_embd.is_multiple_of(self.n_head),
            "n_embd ({}) must be divisible by n_head ({})",
            self.n_embd,
            self.n_head
        );
        ensure!(
            (0.0..1.0).contains(&self.dropout),
            "dropout ({}) must be in [0, 1)",
            self.dropout
        );
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

/// Complete GPT model that maps token ids to next-token logits.
#[derive(Debug)]
pub struct GPT {
    config: GPTConfig,
    token_embed: Embedding,
    pos_embed: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
}

impl GPT {
    pub fn new(
        config: GPTConfig,
        token_embed: Embedding,
        pos_embed: Embedding,
        blocks: Vec<Block>,
        ln_f: LayerNorm,
        lm_head: Linear,
    ) -> Self {
        Self {
            config,
            token_embed,
            pos_embed,
            blocks,
            ln_f,
            lm_head,
        }
    }

    pub fn config(&self) -> &GPTConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Token embedding plus learned position embedding, shaped (B, T, n_embd).
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        ensure!(seq_len > 0, "forward expects seq_len > 0");
        ensure!(
            seq_len <= self.config.block_size,
            "sequence length {} exceeds block_size {}; truncate the context first",
            seq_len,
            self.config.block_size
        );
        let max_id = input_ids
            .to_dtype(DType::U32)?
            .max_all()?
            .to_scalar::<u32>()? as usize;
        ensure!(
            max_id < self.config.vocab_size,
            "token id {} out of range for vocab_size {}",
            max_id,
            self.config.vocab_size
        );

        let tokens = self.token_embed.forward(input_ids)?;
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let positions = self.pos_embed.forward(&positions)?; // (T, C)
        Ok(tokens.broadcast_add(&positions)?)
    }

    /// Logits shaped (B, T, vocab_size). `train` enables dropout.
    pub fn forward(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let mut hidden = self.embed(input_ids)?;
        for block in self.blocks.iter() {
            hidden = block.forward_t(&hidden, train)?;
        }
        let hidden = self.ln_f.forward(&hidden)?;
        Ok(self.lm_head.forward(&hidden)?)
    }

    /// Forward pass followed by mean next-token cross-entropy against `targets`.
    pub fn forward_with_loss(
        &self,
        input_ids: &Tensor,
        targets: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        ensure!(
            input_ids.dims() == targets.dims(),
            "inputs {:?} and targets {:?} must have the same shape",
            input_ids.dims(),
            targets.dims()
        );
        let logits = self.forward(input_ids, train)?;
        let loss = cross_entropy_loss(&logits, targets, -1, LossReduction::Mean)?;
        Ok((logits, loss))
    }

    pub fn device(&self) -> &Device {
        self.token_embed.embeddings().device()
    }
    pub fn dtype(&self) -> DType {
        self.token_embed.embeddings().dtype()
    }
}
