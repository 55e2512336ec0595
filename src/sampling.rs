use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Next-token distribution for each row of `logits` (B, V), after temperature and top-k.
///
/// `temperature` must be > 0 here; see [`sample_next_token`] for the greedy case.
pub fn next_token_probs(
    logits: &Tensor,
    temperature: f64,
    top_k: Option<usize>,
) -> Result<Tensor> {
    ensure!(temperature > 0.0, "temperature must be > 0 to form a distribution");
    let (_b, vocab) = logits.dims2()?;
    let mut scaled = (logits.to_dtype(DType::F32)? / temperature)?;

    if let Some(k) = top_k.filter(|&k| k > 0 && k < vocab) {
        // keep the k largest logits per row, ties with the k-th included
        let thresholds = scaled
            .to_vec2::<f32>()?
            .into_iter()
            .map(|mut row| {
                row.sort_unstable_by(|a, b| b.total_cmp(a));
                row[k - 1]
            })
            .collect::<Vec<_>>();
        let thresholds = Tensor::from_vec(thresholds, (scaled.dim(0)?, 1), scaled.device())?;
        let keep = scaled.broadcast_ge(&thresholds)?;
        let neg_inf = Tensor::full(f32::NEG_INFINITY, scaled.dims().to_vec(), scaled.device())?;
        scaled = keep.where_cond(&scaled, &neg_inf)?;
    }

    Ok(softmax_last_dim(&scaled)?)
}

/// Draw one token per row of `logits` (B, V); returns ids shaped (B, 1).
///
/// `temperature == 0.0` picks the argmax; otherwise the softmax of
/// `logits / temperature` (restricted to `top_k` when given) is sampled with `rng`.
pub fn sample_next_token<R: Rng>(
    logits: &Tensor,
    rng: &mut R,
    temperature: f64,
    top_k: Option<usize>,
) -> Result<Tensor> {
    ensure!(temperature >= 0.0, "temperature must be >= 0");
    if temperature == 0.0 {
        return Ok(logits.argmax_keepdim(D::Minus1)?);
    }

    let probs = next_token_probs(logits, temperature, top_k)?;
    let rows = probs.to_vec2::<f32>()?;
    let mut ids = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        let dist = WeightedIndex::new(row)?;
        ids.push(dist.sample(rng) as u32);
    }
    Ok(Tensor::from_vec(ids, (rows.len(), 1), logits.device())?)
}
