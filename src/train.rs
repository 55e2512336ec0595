//! Training loop.
//!
//! Gradients and parameter updates are delegated to a candle [`Optimizer`];
//! this module only decides what loss is minimized and when to evaluate.
//!
//! ```text
//! Idle -> Running(0) -> Evaluating(0) -> Running(0) -> ... -> Running(n-1) -> Evaluating(n-1) -> Done
//! ```

use anyhow::{anyhow, ensure, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::TokenDataset;
use crate::model::GPT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub max_iters: usize,
    /// Evaluate every this many iterations (and on the last one).
    pub eval_interval: usize,
    /// Batches averaged per split when evaluating.
    pub eval_iters: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_iters: 5000,
            eval_interval: 500,
            eval_iters: 200,
            learning_rate: 3e-4,
            weight_decay: 0.01,
            seed: 1337,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be > 0");
        ensure!(self.eval_interval > 0, "eval_interval must be > 0");
        ensure!(self.eval_iters > 0, "eval_iters must be > 0");
        ensure!(
            self.learning_rate > 0.0 && self.learning_rate.is_finite(),
            "learning_rate must be a positive number"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainPhase {
    Idle,
    Running(usize),
    Evaluating(usize),
    Done,
}

/// Mean losses over both splits at one point of training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalRecord {
    pub step: usize,
    pub train_loss: f32,
    pub val_loss: f32,
}

pub struct Trainer<'a, O: Optimizer> {
    model: &'a GPT,
    /// Trainable variables by name, in name order.
    params: Vec<(String, Var)>,
    optimizer: O,
    config: TrainConfig,
    phase: TrainPhase,
    history: Vec<EvalRecord>,
}

impl<'a> Trainer<'a, AdamW> {
    /// Trainer over every variable in `varmap` using AdamW.
    pub fn adamw(model: &'a GPT, varmap: &VarMap, config: TrainConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Self::new(model, varmap, optimizer, config)
    }
}

impl<'a, O: Optimizer> Trainer<'a, O> {
    /// `varmap` must hold the variables `optimizer` updates.
    pub fn new(
        model: &'a GPT,
        varmap: &VarMap,
        optimizer: O,
        config: TrainConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut params: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("var map lock poisoned"))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            model,
            params,
            optimizer,
            config,
            phase: TrainPhase::Idle,
            history: Vec::new(),
        })
    }

    pub fn phase(&self) -> TrainPhase {
        self.phase
    }

    pub fn history(&self) -> &[EvalRecord] {
        &self.history
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// One optimization step on a batch; returns the loss before the update.
    ///
    /// Nothing is updated when the loss or any gradient is not finite.
    pub fn step(&mut self, inputs: &Tensor, targets: &Tensor) -> Result<f32> {
        let (_logits, loss) = self.model.forward_with_loss(inputs, targets, true)?;
        let value = loss.to_scalar::<f32>()?;
        ensure!(value.is_finite(), "training loss is not finite ({value})");
        let grads = loss.backward()?;
        self.check_gradients(&grads)?;
        self.optimizer.step(&grads)?;
        Ok(value)
    }

    /// Error on the first parameter (in name order) whose gradient holds a NaN or infinity.
    pub fn check_gradients(&self, grads: &GradStore) -> Result<()> {
        for (name, var) in self.params.iter() {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            // NaN and inf both survive a sum
            let total = grad.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            ensure!(total.is_finite(), "gradient of {name} is not finite");
        }
        Ok(())
    }

    /// Loss of a batch in inference mode, without touching the parameters.
    pub fn batch_loss(&self, inputs: &Tensor, targets: &Tensor) -> Result<f32> {
        let (_logits, loss) = self.model.forward_with_loss(inputs, targets, false)?;
        Ok(loss.to_scalar::<f32>()?)
    }

    /// Mean inference-mode loss over `eval_iters` random batches of `data`.
    pub fn estimate_loss<R: Rng>(&self, data: &TokenDataset, rng: &mut R) -> Result<f32> {
        let block_size = self.model.config().block_size;
        let mut total = 0f32;
        for _ in 0..self.config.eval_iters {
            let (x, y) =
                data.get_batch(rng, self.config.batch_size, block_size, self.model.device())?;
            total += self.batch_loss(&x, &y)?;
        }
        Ok(total / self.config.eval_iters as f32)
    }

    pub fn evaluate<R: Rng>(
        &mut self,
        step: usize,
        train: &TokenDataset,
        val: &TokenDataset,
        rng: &mut R,
    ) -> Result<EvalRecord> {
        self.phase = TrainPhase::Evaluating(step);
        let record = EvalRecord {
            step,
            train_loss: self.estimate_loss(train, rng)?,
            val_loss: self.estimate_loss(val, rng)?,
        };
        ensure!(
            record.train_loss.is_finite() && record.val_loss.is_finite(),
            "evaluation loss is not finite at step {step}: {record:?}"
        );
        info!(
            "step {}: train loss {:.4}, val loss {:.4}",
            step, record.train_loss, record.val_loss
        );
        self.history.push(record);
        Ok(record)
    }

    /// Train for `max_iters` iterations, evaluating on the configured cadence.
    pub fn run<R: Rng>(
        &mut self,
        train: &TokenDataset,
        val: &TokenDataset,
        rng: &mut R,
    ) -> Result<&[EvalRecord]> {
        let block_size = self.model.config().block_size;
        let last = self.config.max_iters.saturating_sub(1);

        for iter in 0..self.config.max_iters {
            self.phase = TrainPhase::Running(iter);
            if iter % self.config.eval_interval == 0 || iter == last {
                self.evaluate(iter, train, val, rng)?;
                self.phase = TrainPhase::Running(iter);
            }

            let (x, y) =
                train.get_batch(rng, self.config.batch_size, block_size, self.model.device())?;
            let loss = self.step(&x, &y)?;
            debug!("iter {iter}: loss {loss:.4}");
        }

        self.phase = TrainPhase::Done;
        Ok(&self.history)
    }
}
