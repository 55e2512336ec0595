use candle_core::{bail, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT};

use crate::model::gpt::GPTConfig;
use crate::model::ops::{attention_probs, build_causal_mask, LayerNorm};

/// Transformer block wiring attention and feed-forward sublayers.
///
/// Pre-norm residual layout: `x + attn(ln_1(x))`, then `x + mlp(ln_2(x))`.
#[derive(Debug)]
pub struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub fn new(ln_1: LayerNorm, attn: CausalSelfAttention, ln_2: LayerNorm, mlp: Mlp) -> Self {
        Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        }
    }

    pub fn attn(&self) -> &CausalSelfAttention {
        &self.attn
    }
}

impl ModuleT for Block {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let attn_input = self.ln_1.forward(x)?;
        let attn_out = self.attn.forward_t(&attn_input, train)?;
        let residual = x.add(&attn_out)?;
        let mlp_input = self.ln_2.forward(&residual)?;
        let mlp_out = self.mlp.forward_t(&mlp_input, train)?;
        residual.add(&mlp_out)
    }
}

#[derive(Debug)]
pub struct CausalSelfAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    n_head: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    pub fn new(q: Linear, k: Linear, v: Linear, o: Linear, config: &GPTConfig) -> Self {
        Self {
            q,
            k,
            v,
            o,
            attn_dropout: Dropout::new(config.dropout),
            resid_dropout: Dropout::new(config.dropout),
            n_head: config.n_head,
            head_dim: config.head_dim(),
        }
    }

    /// Project `x` (B, T, C) into one head-major tensor (B, H, T, D).
    fn heads(&self, proj: &Linear, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        proj.forward(x)?
            .reshape((batch, seq_len, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Causally masked attention probabilities shaped (B, H, T, T), before dropout.
    pub fn attention_probs(&self, x: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len, _) = x.dims3()?;
        if seq_len == 0 {
            bail!("attention expects seq_len > 0");
        }

        let q = self.heads(&self.q, x)?;
        let k = self.heads(&self.k, x)?;
        let mask = build_causal_mask(x.device(), seq_len)?.reshape((1, 1, seq_len, seq_len))?;
        attention_probs(&q, &k, Some(&mask))
    }

    /// Attention weights actually applied to the values: probabilities after dropout.
    pub fn attention_weights(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let probs = self.attention_probs(x)?;
        // dropout only rescales or zeroes weights, masked entries stay zero
        self.attn_dropout.forward_t(&probs, train)
    }

    fn attend(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let probs = self.attention_weights(x, train)?;
        let v = self.heads(&self.v, x)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.n_head * self.head_dim))?;

        let out = self.o.forward(&context)?;
        self.resid_dropout.forward_t(&out, train)
    }
}

impl ModuleT for CausalSelfAttention {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.attend(x, train)
    }
}

/// Position-wise feed-forward: expand, ReLU, project back, dropout.
#[derive(Debug)]
pub struct Mlp {
    up: Linear,
    down: Linear,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(up: Linear, down: Linear, dropout: f32) -> Self {
        Self {
            up,
            down,
            dropout: Dropout::new(dropout),
        }
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.up.forward(x)?.relu()?;
        let out = self.down.forward(&h)?;
        self.dropout.forward_t(&out, train)
    }
}
