//! Encoded corpus and random training windows.
//!
//! A batch is `B` windows of `T` ids drawn uniformly from the token stream.
//! Targets are the same windows shifted one id to the right, so position `t`
//! of the target holds the id that follows position `t` of the input.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use rand::Rng;

use crate::model::TokenId;

/// Fraction of the corpus used for training; the tail is held out for validation.
pub const TRAIN_FRACTION: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDataset {
    tokens: Vec<TokenId>,
}

impl TokenDataset {
    pub fn new(tokens: Vec<TokenId>) -> Self {
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Split into a leading training part and a trailing validation part.
    pub fn split(self, train_fraction: f64) -> Result<(Self, Self)> {
        ensure!(
            (0.0..=1.0).contains(&train_fraction),
            "train fraction ({train_fraction}) must be in [0, 1]"
        );
        let n = (train_fraction * self.tokens.len() as f64) as usize;
        let mut train = self.tokens;
        let val = train.split_off(n);
        Ok((Self::new(train), Self::new(val)))
    }

    /// Draw `batch_size` windows of `block_size` ids.
    ///
    /// Returns `(inputs, targets)`, both `(batch_size, block_size)`; inputs are
    /// `u32`, targets are `i64`.
    pub fn get_batch<R: Rng>(
        &self,
        rng: &mut R,
        batch_size: usize,
        block_size: usize,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        ensure!(batch_size > 0, "batch_size must be > 0");
        ensure!(block_size > 0, "block_size must be > 0");
        ensure!(
            self.tokens.len() > block_size,
            "dataset of {} tokens is too short for block_size {}",
            self.tokens.len(),
            block_size
        );

        let mut xs = Vec::with_capacity(batch_size * block_size);
        let mut ys = Vec::with_capacity(batch_size * block_size);
        for _ in 0..batch_size {
            let start = rng.gen_range(0..self.tokens.len() - block_size);
            let window = &self.tokens[start..start + block_size + 1];
            xs.extend_from_slice(&window[..block_size]);
            ys.extend(window[1..].iter().map(|&id| id as i64));
        }

        let inputs = Tensor::from_vec(xs, (batch_size, block_size), device)?;
        let targets = Tensor::from_vec(ys, (batch_size, block_size), device)?;
        Ok((inputs, targets))
    }
}
