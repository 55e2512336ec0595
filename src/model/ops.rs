use anyhow::Result;
use candle_core::{Device, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Per-position standardization over the last dimension with learned scale and shift.
///
/// Built from primitive tensor ops so gradients flow through it on every backend.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    pub fn load(size: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self::new(weight, bias, LAYER_NORM_EPS))
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Lower-triangular keep-mask shaped (seq_len, seq_len): 1 where key <= query.
pub fn build_causal_mask(device: &Device, seq_len: usize) -> candle_core::Result<Tensor> {
    // Build explicit (seq_len, seq_len) grids to avoid ambiguous broadcasting
    let query_positions = Tensor::arange(0u32, seq_len as u32, device)?.reshape((seq_len, 1))?;
    let key_positions = Tensor::arange(0u32, seq_len as u32, device)?.reshape((1, seq_len))?;

    let q_grid = query_positions.repeat((1, seq_len))?;
    let k_grid = key_positions.repeat((seq_len, 1))?;
    q_grid.ge(&k_grid)
}

/// Scaled dot-product attention probabilities.
///
/// Expects `q`, `k` shaped `[batch, heads, seq_len, head_dim]`. The mask, when
/// given, is broadcastable to `[batch, heads, seq_len, seq_len]` with nonzero
/// meaning keep. Masked scores become `-inf` so they get exactly zero weight.
pub fn attention_probs(
    q: &Tensor,
    k: &Tensor,
    mask: Option<&Tensor>,
) -> candle_core::Result<Tensor> {
    let (_, _, _, hd) = q.dims4()?;
    let scale = (hd as f64).sqrt();

    let k_t = k.transpose(2, 3)?.contiguous()?;
    let mut scores = (q.matmul(&k_t)? / scale)?;

    if let Some(m) = mask {
        let m = m.broadcast_as(scores.shape())?;
        let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims().to_vec(), scores.device())?
            .to_dtype(scores.dtype())?;
        scores = m.where_cond(&scores, &neg_inf)?;
    }

    candle_nn::ops::softmax(&scores, D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    #[test]
    fn layer_norm_standardizes_each_row() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let ln = LayerNorm::new(
            Tensor::ones(4, candle_core::DType::F32, &device)?,
            Tensor::zeros(4, candle_core::DType::F32, &device)?,
            LAYER_NORM_EPS,
        );
        let x = Tensor::from_vec(
            vec![1f32, 2., 3., 4., 10., 10., 10., 10.],
            (2, 4),
            &device,
        )?;
        let y = ln.forward(&x)?;

        let row0 = y.i(0)?.to_vec1::<f32>()?;
        let mean: f32 = row0.iter().sum::<f32>() / 4.0;
        let var: f32 = row0.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5, "mean={mean}");
        assert!((var - 1.0).abs() < 1e-3, "var={var}");

        // constant row has no variance to normalize and collapses to the shift
        let row1 = y.i(1)?.to_vec1::<f32>()?;
        assert!(row1.iter().all(|v| v.abs() < 1e-3), "{row1:?}");
        Ok(())
    }

    #[test]
    fn layer_norm_applies_scale_and_shift() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let ln = LayerNorm::new(
            Tensor::new(&[2f32, 2.], &device)?,
            Tensor::new(&[1f32, 1.], &device)?,
            LAYER_NORM_EPS,
        );
        let y = ln.forward(&Tensor::new(&[[-1f32, 1.]], &device)?)?;
        let got = y.i(0)?.to_vec1::<f32>()?;
        assert!((got[0] + 1.0).abs() < 1e-3, "{got:?}");
        assert!((got[1] - 3.0).abs() < 1e-3, "{got:?}");
        Ok(())
    }

    #[test]
    fn causal_mask_is_lower_triangular() -> anyhow::Result<()> {
        let mask = build_causal_mask(&Device::Cpu, 3)?.to_vec2::<u8>()?;
        assert_eq!(mask, vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]);
        Ok(())
    }

    #[test]
    fn masked_probs_put_no_weight_on_future_keys() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 5, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 2, 5, 4), &device)?;
        let mask = build_causal_mask(&device, 5)?.reshape((1, 1, 5, 5))?;
        let probs = attention_probs(&q, &k, Some(&mask))?;

        let rows = probs.i((0, 1))?.to_vec2::<f32>()?;
        for (t, row) in rows.iter().enumerate() {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5, "row {t} sums to {total}");
            assert!(row.iter().all(|p| *p >= 0.0));
            assert!(row[t + 1..].iter().all(|p| *p == 0.0), "row {t}: {row:?}");
        }
        Ok(())
    }
}
