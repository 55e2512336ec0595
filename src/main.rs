//! Train a character-level GPT on a text file, then sample from it.
//!
//! ```bash
//! cargo run --release -- --data input.txt
//! cargo run --release -- --data input.txt --config run.json --max-iters 200 --temperature 0.8
//! ```

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use nanogpt_rs::data::{TokenDataset, TRAIN_FRACTION};
use nanogpt_rs::model::builder::num_params;
use nanogpt_rs::model::{init_gpt, pick_device};
use nanogpt_rs::{Engine, RunConfig, Tokenizer, Trainer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nanogpt", about = "Train a character-level GPT and sample from it")]
struct Args {
    /// Training corpus (UTF-8 text)
    #[arg(long)]
    data: PathBuf,

    /// JSON run configuration; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    max_iters: Option<usize>,

    /// Characters to generate after training
    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Seed for weight init, batch sampling and generation
    #[arg(long)]
    seed: Option<u64>,

    /// 0 picks the most likely character every step
    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long)]
    top_k: Option<usize>,
}

impl Args {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };
        if let Some(n) = self.max_iters {
            config.train.max_iters = n;
        }
        if let Some(seed) = self.seed {
            config.train.seed = seed;
        }
        if let Some(n) = self.max_new_tokens {
            config.sample.max_new_tokens = n;
        }
        if let Some(t) = self.temperature {
            config.sample.temperature = t;
        }
        if self.top_k.is_some() {
            config.sample.top_k = self.top_k;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args.run_config()?;

    let text = fs::read_to_string(&args.data)
        .with_context(|| format!("failed to read corpus {}", args.data.display()))?;
    let tokenizer = Tokenizer::from_corpus(&text)?;
    let (train, val) = TokenDataset::new(tokenizer.encode(&text)?).split(TRAIN_FRACTION)?;
    info!(
        "corpus: {} chars, vocab {}, train {} / val {}",
        text.chars().count(),
        tokenizer.vocab_size(),
        train.len(),
        val.len()
    );

    let device = pick_device(0)?;
    let mut rng = StdRng::seed_from_u64(config.train.seed);
    let gpt_config = config.model.with_vocab(tokenizer.vocab_size());
    let (model, varmap) = init_gpt(&gpt_config, &device, &mut rng)?;
    info!(
        "model: {} parameters on {:?}",
        num_params(&varmap),
        device
    );

    let mut trainer = Trainer::adamw(&model, &varmap, config.train.clone())?;
    let history = trainer.run(&train, &val, &mut rng)?;
    if let Some(last) = history.last() {
        info!(
            "finished: train loss {:.4}, val loss {:.4}",
            last.train_loss, last.val_loss
        );
    }

    let engine = Engine::new(&model);
    let mut stdout = std::io::stdout().lock();
    engine.generate_with(
        &[],
        config.sample.max_new_tokens,
        &config.sample.params(),
        &mut rng,
        |id| {
            write!(stdout, "{}", tokenizer.decode(&[id])?)?;
            stdout.flush()?;
            Ok(())
        },
    )?;
    writeln!(stdout)?;
    Ok(())
}
