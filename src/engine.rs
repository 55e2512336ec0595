//! Autoregressive generation.
//!
//! Every step re-runs the model over the trailing `block_size` ids; there is no
//! key/value cache, so the output distribution only depends on that window.

use anyhow::{ensure, Result};
use candle_core::{IndexOp, Tensor};
use rand::Rng;
use tracing::debug;

use crate::model::{TokenId, GPT};
use crate::sampling::{next_token_probs, sample_next_token};

/// Id the model is conditioned on when generation starts from an empty seed.
pub const PLACEHOLDER_TOKEN: TokenId = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_k: Option<usize>,
}

impl SamplingParams {
    pub fn new(temperature: f64, top_k: Option<usize>) -> Self {
        Self { temperature, top_k }
    }
}

impl Default for SamplingParams {
    /// Plain sampling from the model's softmax.
    fn default() -> Self {
        Self::new(1.0, None)
    }
}

pub struct Engine<'a> {
    model: &'a GPT,
}

impl<'a> Engine<'a> {
    pub fn new(model: &'a GPT) -> Self {
        Self { model }
    }

    /// The slice of `context` the model actually sees.
    pub fn window<'c>(&self, context: &'c [TokenId]) -> &'c [TokenId] {
        let block_size = self.model.config().block_size;
        &context[context.len().saturating_sub(block_size)..]
    }

    /// Logits (V,) for the id following `context`, computed over its trailing window.
    pub fn next_token_logits(&self, context: &[TokenId]) -> Result<Tensor> {
        let window = self.window(context);
        let window = if window.is_empty() {
            &[PLACEHOLDER_TOKEN][..]
        } else {
            window
        };
        let input = Tensor::new(window, self.model.device())?.unsqueeze(0)?;
        let logits = self.model.forward(&input, false)?;
        Ok(logits.i((0, window.len() - 1))?)
    }

    /// Next-token probabilities for `context` under `params` (temperature must be > 0).
    pub fn next_token_probs(
        &self,
        context: &[TokenId],
        params: &SamplingParams,
    ) -> Result<Vec<f32>> {
        let logits = self.next_token_logits(context)?.unsqueeze(0)?;
        let probs = next_token_probs(&logits, params.temperature, params.top_k)?;
        Ok(probs.i(0)?.to_vec1::<f32>()?)
    }

    /// Extend `seed` by `max_new_tokens` sampled ids and return the whole sequence.
    pub fn generate<R: Rng>(
        &self,
        seed: &[TokenId],
        max_new_tokens: usize,
        params: &SamplingParams,
        rng: &mut R,
    ) -> Result<Vec<TokenId>> {
        self.generate_with(seed, max_new_tokens, params, rng, |_| Ok(()))
    }

    /// Like [`Engine::generate`], calling `on_token` with each id as it is produced.
    ///
    /// An error from `on_token` stops generation and is returned.
    pub fn generate_with<R, F>(
        &self,
        seed: &[TokenId],
        max_new_tokens: usize,
        params: &SamplingParams,
        rng: &mut R,
        mut on_token: F,
    ) -> Result<Vec<TokenId>>
    where
        R: Rng,
        F: FnMut(TokenId) -> Result<()>,
    {
        let vocab_size = self.model.config().vocab_size;
        ensure!(
            seed.iter().all(|&id| (id as usize) < vocab_size),
            "seed contains ids outside the vocabulary of {vocab_size}"
        );

        let mut tokens = Vec::with_capacity(seed.len() + max_new_tokens);
        tokens.extend_from_slice(seed);
        for _ in 0..max_new_tokens {
            let logits = self.next_token_logits(&tokens)?.unsqueeze(0)?;
            let next = sample_next_token(&logits, rng, params.temperature, params.top_k)?
                .i((0, 0))?
                .to_scalar::<u32>()?;
            on_token(next)?;
            tokens.push(next);
        }
        debug!(
            "generated {} tokens from a seed of {}",
            max_new_tokens,
            seed.len()
        );
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{init_gpt, GPTConfig};
    use candle_core::Device;
    use candle_nn::VarMap;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(block_size: usize, vocab_size: usize) -> (GPT, VarMap) {
        let config = GPTConfig {
            vocab_size,
            n_embd: 16,
            n_layer: 2,
            n_head: 2,
            block_size,
            dropout: 0.1,
        };
        init_gpt(&config, &Device::Cpu, &mut StdRng::seed_from_u64(1)).unwrap()
    }

    #[test]
    fn generate_returns_seed_plus_new_tokens() -> Result<()> {
        let (model, _vars) = model(4, 5);
        let engine = Engine::new(&model);
        let params = SamplingParams::default();
        let mut rng = StdRng::seed_from_u64(0);

        for n in [0, 1, 3, 9] {
            let seed: Vec<TokenId> = vec![1, 2, 3];
            let out = engine.generate(&seed, n, &params, &mut rng)?;
            assert_eq!(out.len(), seed.len() + n);
            assert_eq!(&out[..3], &seed[..]);
            assert!(out.iter().all(|&id| id < 5));
        }
        Ok(())
    }

    #[test]
    fn zero_new_tokens_returns_seed_unchanged() -> Result<()> {
        let (model, _vars) = model(4, 5);
        let engine = Engine::new(&model);
        let mut rng = StdRng::seed_from_u64(0);
        let out = engine.generate(&[4, 0, 4], 0, &SamplingParams::default(), &mut rng)?;
        assert_eq!(out, vec![4, 0, 4]);
        Ok(())
    }

    #[test]
    fn empty_seed_is_conditioned_on_placeholder() -> Result<()> {
        let (model, _vars) = model(4, 5);
        let engine = Engine::new(&model);
        let mut rng = StdRng::seed_from_u64(0);
        let out = engine.generate(&[], 6, &SamplingParams::default(), &mut rng)?;
        assert_eq!(out.len(), 6);

        let params = SamplingParams::default();
        assert_eq!(
            engine.next_token_probs(&[], &params)?,
            engine.next_token_probs(&[PLACEHOLDER_TOKEN], &params)?
        );
        Ok(())
    }

    #[test]
    fn long_context_uses_only_the_last_window() -> Result<()> {
        let (model, _vars) = model(4, 5);
        let engine = Engine::new(&model);
        let params = SamplingParams::default();

        let long = [0, 1, 2, 3, 4, 0, 1, 2];
        assert_eq!(engine.window(&long), &[4, 0, 1, 2]);
        let full = engine.next_token_probs(&long, &params)?;
        let truncated = engine.next_token_probs(&long[4..], &params)?;
        assert_eq!(full, truncated);

        let total: f32 = full.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn same_rng_seed_same_generation() -> Result<()> {
        let (model, _vars) = model(6, 5);
        let engine = Engine::new(&model);
        let params = SamplingParams::default();
        let a = engine.generate(&[2], 20, &params, &mut StdRng::seed_from_u64(5))?;
        let b = engine.generate(&[2], 20, &params, &mut StdRng::seed_from_u64(5))?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn streaming_sees_every_new_token() -> Result<()> {
        let (model, _vars) = model(4, 5);
        let engine = Engine::new(&model);
        let mut seen = Vec::new();
        let out = engine.generate_with(
            &[1],
            5,
            &SamplingParams::default(),
            &mut StdRng::seed_from_u64(3),
            |id| {
                seen.push(id);
                Ok(())
            },
        )?;
        assert_eq!(&out[1..], &seen[..]);
        Ok(())
    }

    #[test]
    fn callback_error_stops_generation() {
        let (model, _vars) = model(4, 5);
        let engine = Engine::new(&model);
        let mut calls = 0;
        let result = engine.generate_with(
            &[1],
            10,
            &SamplingParams::default(),
            &mut StdRng::seed_from_u64(3),
            |_| {
                calls += 1;
                anyhow::ensure!(calls < 3, "sink closed");
                Ok(())
            },
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("sink closed"), "{err}");
        assert_eq!(calls, 3);
    }

    #[test]
    fn out_of_vocab_seed_is_rejected() {
        let (model, _vars) = model(4, 5);
        let engine = Engine::new(&model);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(engine
            .generate(&[7], 1, &SamplingParams::default(), &mut rng)
            .is_err());
    }
}
