//! A small character-level GPT.
//!
//! The model is a decoder-only transformer built on candle: token and learned
//! position embeddings, `n_layer` pre-norm blocks of causal self-attention and
//! a ReLU feed-forward, a final layer norm and a linear head over the
//! character vocabulary. Gradients come from candle's autodiff; training only
//! fixes the loss (mean next-character cross entropy) and the update cadence.

pub mod config;
pub mod data;
pub mod engine;
pub mod model;
pub mod sampling;
pub mod tokenizer;
pub mod train;

pub use config::RunConfig;
pub use engine::{Engine, SamplingParams};
pub use model::{GPTConfig, TokenId, GPT};
pub use tokenizer::Tokenizer;
pub use train::{EvalRecord, TrainConfig, Trainer};
