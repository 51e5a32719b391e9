use std::{cell::Cell, sync::Arc};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    distributed::{Collective, DistributedModel, Sharding},
    error::Result,
    precision::{AutocastContext, Precision},
    TrainingError,
};

/// Interface the loop needs from a language model; the architecture lives
/// outside this crate.
pub trait LanguageModel {
    /// Maps `[batch, seq]` token ids to `[batch, seq, vocab]` float32 logits.
    fn forward(&self, input_ids: &Tensor, ctx: &AutocastContext) -> Result<Tensor>;

    /// Trainable parameters in a stable order.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    fn device(&self) -> &Device;
}

impl<M: LanguageModel + ?Sized> LanguageModel for Box<M> {
    fn forward(&self, input_ids: &Tensor, ctx: &AutocastContext) -> Result<Tensor> {
        (**self).forward(input_ids, ctx)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        (**self).parameters()
    }

    fn set_training(&self, training: bool) {
        (**self).set_training(training)
    }

    fn is_training(&self) -> bool {
        (**self).is_training()
    }

    fn device(&self) -> &Device {
        (**self).device()
    }
}

/// A model either used directly or wrapped for distributed execution.
pub enum ModelHandle<M> {
    Plain(M),
    Wrapped(DistributedModel<M>),
}

impl<M: LanguageModel> ModelHandle<M> {
    pub fn underlying(&self) -> &M {
        match self {
            ModelHandle::Plain(model) => model,
            ModelHandle::Wrapped(wrapper) => wrapper.module(),
        }
    }

    pub fn distributed(&self) -> Option<&DistributedModel<M>> {
        match self {
            ModelHandle::Plain(_) => None,
            ModelHandle::Wrapped(wrapper) => Some(wrapper),
        }
    }

    pub fn forward(&self, input_ids: &Tensor, ctx: &AutocastContext) -> Result<Tensor> {
        self.underlying().forward(input_ids, ctx)
    }

    pub fn parameters(&self) -> Vec<(String, Var)> {
        self.underlying().parameters()
    }

    pub fn set_training(&self, training: bool) {
        self.underlying().set_training(training)
    }

    pub fn is_training(&self) -> bool {
        self.underlying().is_training()
    }

    pub fn world_size(&self) -> usize {
        self.distributed().map_or(1, |wrapper| wrapper.world_size())
    }

    pub fn collective(&self) -> Option<&Arc<dyn Collective>> {
        self.distributed().map(|wrapper| wrapper.collective())
    }

    pub fn is_sharded(&self) -> bool {
        self.distributed()
            .is_some_and(|wrapper| wrapper.sharding() == Sharding::Sharded && wrapper.world_size() > 1)
    }

    /// Averages gradients across workers; a no-op for plain models.
    pub fn synchronize_gradients(&self, grads: &mut GradStore) -> Result<()> {
        match self {
            ModelHandle::Plain(_) => Ok(()),
            ModelHandle::Wrapped(wrapper) => wrapper.synchronize_gradients(grads),
        }
    }

    pub fn after_optimizer_step(&self) -> Result<()> {
        match self {
            ModelHandle::Plain(_) => Ok(()),
            ModelHandle::Wrapped(wrapper) => wrapper.gather_parameters(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BigramConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub precision: Precision,
    pub seed: u64,
}

/// Reference model used by the CLI and the tests: token embedding followed by
/// a tied-width projection back to the vocabulary.
pub struct BigramLm {
    embedding: Var,
    projection: Var,
    bias: Var,
    device: Device,
    training: Cell<bool>,
}

impl BigramLm {
    pub fn new(config: &BigramConfig, device: &Device) -> Result<Self> {
        if config.vocab_size == 0 || config.hidden_size == 0 {
            return Err(TrainingError::initialization(
                "reference model requires vocab_size and hidden_size > 0",
            ));
        }
        let dtype = config.precision.parameter_dtype();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let std = (1.0 / config.hidden_size as f64).sqrt();

        let embedding = random_var(
            &mut rng,
            (config.vocab_size, config.hidden_size),
            std,
            dtype,
            device,
        )?;
        let projection = random_var(
            &mut rng,
            (config.hidden_size, config.vocab_size),
            std,
            dtype,
            device,
        )?;
        let bias = Var::from_tensor(&Tensor::zeros(config.vocab_size, dtype, device)?)?;

        Ok(Self {
            embedding,
            projection,
            bias,
            device: device.clone(),
            training: Cell::new(true),
        })
    }
}

fn random_var(
    rng: &mut StdRng,
    shape: (usize, usize),
    std: f64,
    dtype: DType,
    device: &Device,
) -> Result<Var> {
    let count = shape.0 * shape.1;
    let values: Vec<f32> = (0..count)
        .map(|_| (rng.gen::<f64>() * 2.0 - 1.0) as f32 * std as f32)
        .collect();
    let tensor = Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?;
    Ok(Var::from_tensor(&tensor)?)
}

impl LanguageModel for BigramLm {
    fn forward(&self, input_ids: &Tensor, ctx: &AutocastContext) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let flat_ids = input_ids.flatten_all()?.to_dtype(DType::U32)?;
        let hidden = self
            .embedding
            .as_tensor()
            .index_select(&flat_ids, 0)?;
        let hidden = ctx.cast(&hidden)?;
        let projection = ctx.cast(self.projection.as_tensor())?;
        let bias = ctx.cast(self.bias.as_tensor())?;
        let logits = hidden.matmul(&projection)?.broadcast_add(&bias)?;
        let vocab = logits.dim(1)?;
        let logits = ctx.restore(&logits)?.to_dtype(DType::F32)?;
        Ok(logits.reshape((batch, seq, vocab))?)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("embed.weight".to_string(), self.embedding.clone()),
            ("head.weight".to_string(), self.projection.clone()),
            ("head.bias".to_string(), self.bias.clone()),
        ]
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
