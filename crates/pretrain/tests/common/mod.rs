#![allow(dead_code)]

use std::{
    cell::Cell,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use pretrain::{
    config::{LoggingConfig, ScheduleStrategy},
    precision::AutocastContext,
    BigramConfig, BigramLm, LanguageModel, LrScheduler, Optimizer, Precision, TokenBatch,
    TrainingConfig, TrainingError,
};

/// Logits are a learned per-vocabulary bias broadcast over every position,
/// so the loss only depends on the targets. Forward calls are counted.
pub struct CountingModel {
    bias: Var,
    vocab_size: usize,
    poison: bool,
    training: Cell<bool>,
    forwards: Arc<AtomicUsize>,
    device: Device,
}

impl CountingModel {
    pub fn new(vocab_size: usize) -> Self {
        let device = Device::Cpu;
        let bias = Var::zeros(vocab_size, DType::F32, &device).unwrap();
        Self {
            bias,
            vocab_size,
            poison: false,
            training: Cell::new(true),
            forwards: Arc::new(AtomicUsize::new(0)),
            device,
        }
    }

    /// Makes every logit NaN, which turns every gradient non-finite.
    pub fn poisoned(mut self) -> Self {
        self.poison = true;
        self
    }

    pub fn forward_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.forwards)
    }

    pub fn forwards(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }
}

impl LanguageModel for CountingModel {
    fn forward(&self, input_ids: &Tensor, ctx: &AutocastContext) -> pretrain::Result<Tensor> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        let (batch, seq) = input_ids.dims2()?;
        let zeros = Tensor::zeros((batch, seq, self.vocab_size), DType::F32, &self.device)?;
        let bias = ctx.cast(self.bias.as_tensor())?;
        let logits = ctx.restore(&zeros.broadcast_add(&bias)?)?;
        if self.poison {
            Ok(logits.affine(f64::INFINITY, 0.0)?)
        } else {
            Ok(logits)
        }
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![("head.bias".to_string(), self.bias.clone())]
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn is_training(&self) -> bool {
        self.training.get()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Counts steps and keeps a flattened copy of the gradients it was handed;
/// parameters are never modified.
pub struct RecordingOptimizer {
    params: Vec<Var>,
    learning_rate: f64,
    steps: usize,
    pub last_grads: Vec<Option<Vec<f32>>>,
}

impl RecordingOptimizer {
    pub fn new(params: Vec<(String, Var)>) -> Self {
        Self {
            params: params.into_iter().map(|(_, var)| var).collect(),
            learning_rate: 1e-3,
            steps: 0,
            last_grads: Vec::new(),
        }
    }

    pub fn params(&self) -> &[Var] {
        &self.params
    }

    /// L2 norm over every recorded gradient.
    pub fn last_grad_norm(&self) -> f64 {
        self.last_grads
            .iter()
            .flatten()
            .flat_map(|grad| grad.iter())
            .map(|value| (*value as f64) * (*value as f64))
            .sum::<f64>()
            .sqrt()
    }
}

impl Optimizer for RecordingOptimizer {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.steps += 1;
        self.last_grads = self
            .params
            .iter()
            .map(|var| {
                grads
                    .get(var.as_tensor())
                    .map(|grad| grad.flatten_all()?.to_vec1::<f32>())
                    .transpose()
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn steps_taken(&self) -> usize {
        self.steps
    }
}

/// Constant schedule that counts how often it was asked for a rate.
pub struct CountingScheduler {
    pub calls: Arc<AtomicUsize>,
    pub steps: Arc<std::sync::Mutex<Vec<usize>>>,
}

impl CountingScheduler {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            steps: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl LrScheduler for CountingScheduler {
    fn adjust(&mut self, step: usize) -> f64 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.steps.lock().unwrap().push(step);
        1e-3
    }

    fn learning_rate(&self) -> f64 {
        1e-3
    }
}

pub fn bigram(vocab_size: usize, seed: u64) -> BigramLm {
    bigram_in(vocab_size, seed, Precision::Fp32)
}

/// Bigram model whose parameters use `precision`'s storage dtype.
pub fn bigram_in(vocab_size: usize, seed: u64, precision: Precision) -> BigramLm {
    BigramLm::new(
        &BigramConfig {
            vocab_size,
            hidden_size: 8,
            precision,
            seed,
        },
        &Device::Cpu,
    )
    .unwrap()
}

/// Flattened float32 copy of every model parameter, in order.
pub fn parameter_values<M: LanguageModel>(model: &M) -> Vec<Vec<f32>> {
    model
        .parameters()
        .iter()
        .map(|(_, var)| {
            var.as_tensor()
                .flatten_all()
                .unwrap()
                .to_dtype(DType::F32)
                .unwrap()
                .to_vec1()
                .unwrap()
        })
        .collect()
}

/// `rows` sequences of `width` tokens drawn from a fixed pattern; `offset`
/// changes the pattern.
pub fn batch(rows: usize, width: usize, vocab_size: usize, offset: usize) -> TokenBatch {
    TokenBatch::new(
        (0..rows)
            .map(|r| {
                (0..width)
                    .map(|c| ((r * 7 + c * 3 + offset) % vocab_size) as u32)
                    .collect()
            })
            .collect(),
    )
    .unwrap()
}

/// Small fp32 configuration writing under `dir`, with sinks disabled.
pub fn config(dir: &Path, seq_len: usize, batch_size: usize, epochs: usize) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.data.seq_len = seq_len;
    config.data.batch_size = batch_size;
    config.data.vocab_size = 16;
    config.runtime.epochs = epochs;
    config.runtime.precision = Precision::Fp32;
    config.runtime.log_every_n_steps = 1;
    config.scheduler.strategy = ScheduleStrategy::Const;
    config.scheduler.warmup_steps = 0;
    config.optimizer.learning_rate = 1e-2;
    config.optimizer.weight_decay = 0.0;
    config.logging = LoggingConfig {
        directory: dir.to_path_buf(),
        name: "run".to_string(),
        tensorboard: false,
        wandb: false,
        ..LoggingConfig::default()
    };
    config
}
