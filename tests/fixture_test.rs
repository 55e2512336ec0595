use std::fs;
use std::path::Path;

use anyhow::Result;
use candle_core::Device;
use datatest_stable::{harness, Result as TestResult};
use nanogpt_rs::model::{init_gpt, TokenId};
use nanogpt_rs::{Engine, GPTConfig, SamplingParams};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;

const FIXTURES_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures");

// Run once for each matching JSON file under fixtures/
harness! {
    { test = generation_test, root = format!("{}/generation", FIXTURES_DIR), pattern = r"^.*\.json$" },
}

fn generation_test(path: &Path) -> TestResult<()> {
    let case = GenerationCase::from_file(path)?;
    let (model, _vars) = init_gpt(
        &case.config,
        &Device::Cpu,
        &mut StdRng::seed_from_u64(case.init_seed),
    )?;
    let engine = Engine::new(&model);
    let params = SamplingParams::new(case.temperature.unwrap_or(1.0), case.top_k);

    let run = || {
        engine.generate(
            &case.seed,
            case.max_new_tokens,
            &params,
            &mut StdRng::seed_from_u64(case.rng_seed),
        )
    };
    let out = run()?;

    assert_eq!(out.len(), case.seed.len() + case.max_new_tokens);
    assert_eq!(&out[..case.seed.len()], &case.seed[..]);
    assert!(
        out.iter().all(|&id| (id as usize) < case.config.vocab_size),
        "{out:?}"
    );
    assert_eq!(out, run()?);

    if let Some(window) = &case.window_equivalent {
        let probs = |ctx: &[TokenId]| engine.next_token_probs(ctx, &params);
        assert_eq!(probs(&case.seed)?, probs(window)?);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct GenerationCase {
    config: GPTConfig,
    init_seed: u64,
    rng_seed: u64,
    seed: Vec<TokenId>,
    max_new_tokens: usize,
    temperature: Option<f64>,
    top_k: Option<usize>,
    /// Trailing `block_size` ids of `seed`, which must predict identically.
    window_equivalent: Option<Vec<TokenId>>,
}

impl GenerationCase {
    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let case: Self = serde_json::from_str(&content)?;
        Ok(case)
    }
}
