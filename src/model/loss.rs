use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossReduction {
    Mean,
    None,
}

/// Next-token cross entropy for logits and integer class targets.
///
/// - logits: (B, T, V)
/// - targets: (B, T) with class indices in [0, V) or ignore_index
/// - ignore_index: targets equal to this value are ignored in reduction/averaging
/// - reduction:
///   - Mean: returns scalar ()
///   - None: returns per-position loss with shape (B, T)
///
/// Only differentiable primitives are used, so `backward()` on the result reaches
/// every parameter that produced `logits`.
pub fn cross_entropy_loss(
    logits: &Tensor,
    targets: &Tensor,
    ignore_index: i64,
    reduction: LossReduction,
) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let (tb, tt) = targets.dims2()?;
    ensure!(
        (b, t) == (tb, tt),
        "targets shape ({tb}, {tt}) does not match logits batch/time ({b}, {t})"
    );
    let logits = logits.to_dtype(DType::F32)?;
    let targets = targets.to_dtype(DType::I64)?;

    // Flatten to (N, V) and (N,)
    let n = b * t;
    let logits2d = logits.reshape((n, v))?;
    let targets = targets.reshape(n)?;

    // 1 = valid, 0 = ignore
    let ignore_t = Tensor::full(ignore_index, n, targets.device())?;
    let valid_mask = targets.ne(&ignore_t)?;
    // Ignored positions gather class 0 instead of going out of bounds
    let safe_targets = targets.broadcast_mul(&valid_mask.to_dtype(DType::I64)?)?;

    // logsumexp = max + log(sum(exp(x - max)))
    let max_logits = logits2d.max_keepdim(D::Minus1)?; // (N, 1)
    let shifted = logits2d.broadcast_sub(&max_logits)?;
    let sum_exp = shifted.exp()?.sum_keepdim(D::Minus1)?;
    let lse = (max_logits + sum_exp.log()?)?.squeeze(D::Minus1)?; // (N,)

    let gathered = logits2d
        .gather(&safe_targets.to_dtype(DType::U32)?.reshape((n, 1))?, D::Minus1)?
        .squeeze(D::Minus1)?;
    let nll = (lse - gathered)?;
    let valid = valid_mask.to_dtype(DType::F32)?;
    let nll_masked = (nll * &valid)?;

    match reduction {
        LossReduction::None => Ok(nll_masked.reshape((b, t))?),
        LossReduction::Mean => {
            let denom = valid.sum_all()?.to_scalar::<f32>()?;
            if denom == 0.0 {
                // No valid tokens: report +inf rather than dividing by zero
                Ok(Tensor::full(f32::INFINITY, (), logits.device())?)
            } else {
                Ok((nll_masked.sum_all()? / denom as f64)?)
            }
        }
    }
}
