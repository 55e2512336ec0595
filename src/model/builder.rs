use std::panic::{catch_unwind, UnwindSafe};

use anyhow::{anyhow, Result};
use candle_core::{utils, DType, Device, Tensor};
use candle_nn::{embedding, linear, linear_no_bias, VarBuilder, VarMap};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::model::attention::Block;
use crate::model::ops::LayerNorm;
use crate::model::GPT;
use crate::model::{
    attention::{CausalSelfAttention, Mlp},
    gpt::GPTConfig,
};

const EXPANSION_FACTOR: usize = 4;
const INIT_STD: f32 = 0.02;

pub fn build_gpt(vb: VarBuilder, config: &GPTConfig) -> Result<GPT> {
    config.validate()?;
    let lm_head = linear(config.n_embd, config.vocab_size, vb.pp("lm_head"))?;
    let vb = vb.pp("transformer");
    let token_embed = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
    let pos_embed = embedding(config.block_size, config.n_embd, vb.pp("wpe"))?;
    let mut blocks = Vec::with_capacity(config.n_layer);
    for idx in 0..config.n_layer {
        blocks.push(load_block(vb.pp(format!("h.{idx}")), config)?);
    }
    let ln_f = LayerNorm::load(config.n_embd, vb.pp("ln_f"))?;
    Ok(GPT::new(
        config.clone(),
        token_embed,
        pos_embed,
        blocks,
        ln_f,
        lm_head,
    ))
}

pub(crate) fn load_block(vb: VarBuilder, config: &GPTConfig) -> Result<Block> {
    let hidden = config.n_embd * EXPANSION_FACTOR;

    let ln_1 = LayerNorm::load(config.n_embd, vb.pp("ln_1"))?;
    let attn = load_attn(vb.pp("attn"), config)?;
    let ln_2 = LayerNorm::load(config.n_embd, vb.pp("ln_2"))?;
    let vb = vb.pp("mlp");
    let up = linear(config.n_embd, hidden, vb.pp("c_fc"))?;
    let down = linear(hidden, config.n_embd, vb.pp("c_proj"))?;
    let mlp = Mlp::new(up, down, config.dropout);
    Ok(Block::new(ln_1, attn, ln_2, mlp))
}

pub(crate) fn load_attn(vb: VarBuilder, config: &GPTConfig) -> Result<CausalSelfAttention> {
    let q = linear_no_bias(config.n_embd, config.n_embd, vb.pp("c_q"))?;
    let k = linear_no_bias(config.n_embd, config.n_embd, vb.pp("c_k"))?;
    let v = linear_no_bias(config.n_embd, config.n_embd, vb.pp("c_v"))?;
    let o = linear(config.n_embd, config.n_embd, vb.pp("c_proj"))?;

    Ok(CausalSelfAttention::new(q, k, v, o, config))
}

/// Re-draw every trainable tensor from `rng`: weights and embeddings from N(0, 0.02),
/// biases zeroed, layer norms left at scale 1 / shift 0.
///
/// Variables are visited in name order so a given seed always yields the same model.
pub fn init_weights<R: Rng>(varmap: &VarMap, rng: &mut R) -> Result<()> {
    let normal = Normal::new(0f32, INIT_STD)?;
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("var map lock poisoned"))?;
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    for name in names {
        if name.contains(".ln_") {
            continue;
        }
        let var = &vars[name];
        let n = var.elem_count();
        let values: Vec<f32> = if name.ends_with(".bias") {
            vec![0f32; n]
        } else {
            (0..n).map(|_| normal.sample(rng)).collect()
        };
        let fresh =
            Tensor::from_vec(values, var.shape().clone(), var.device())?.to_dtype(var.dtype())?;
        var.set(&fresh)?;
    }
    Ok(())
}

/// Build a freshly initialized model whose parameters live in the returned [`VarMap`].
pub fn init_gpt<R: Rng>(
    config: &GPTConfig,
    device: &Device,
    rng: &mut R,
) -> Result<(GPT, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = build_gpt(vb, config)?;
    init_weights(&varmap, rng)?;
    debug!(
        "initialized model with {} parameters: {:?}",
        num_params(&varmap),
        config
    );
    Ok((model, varmap))
}

pub fn num_params(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

pub fn pick_device(local_rank: usize) -> candle_core::Result<Device> {
    if utils::cuda_is_available() {
        // Try CUDA, fall back to CPU if unavailable/unusable.
        if let Some(device) = safe_try_device(|| Device::new_cuda(local_rank)) {
            return Ok(device);
        }
    }
    if utils::metal_is_available() {
        // Candle Metal initialization may panic on misconfigured environments.
        if let Some(device) = safe_try_device(|| Device::new_metal(0)) {
            return Ok(device);
        }
    }
    Ok(Device::Cpu)
}

fn safe_try_device<F>(f: F) -> Option<Device>
where
    F: FnOnce() -> candle_core::Result<Device> + UnwindSafe,
{
    match catch_unwind(f) {
        Ok(Ok(device)) => Some(device),
        Ok(Err(_)) | Err(_) => None,
    }
}
