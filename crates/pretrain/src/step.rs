use candle_core::{backprop::GradStore, Tensor, Var};

use crate::{
    config::TrainingConfig,
    data::TokenBatch,
    distributed::Collective,
    error::Result,
    loss::CrossEntropyLoss,
    model::{LanguageModel, ModelHandle},
    optimizer::{clip_grad_norm, global_grad_norm, GradientScaler, Optimizer},
    precision::{Autocast, Precision},
    TrainingError,
};

/// How gradients reach the optimizer.
#[derive(Debug, Clone)]
pub enum StepStrategy {
    /// Float16 autocast: scaled backward, unscale, optional clip, scaler-gated
    /// optimizer step, scale update.
    Scaled(GradientScaler),
    /// Everything else: optional clip, then a plain optimizer step.
    Unscaled,
}

impl StepStrategy {
    pub fn for_precision(precision: Precision) -> Self {
        if precision.uses_grad_scaler() {
            StepStrategy::Scaled(GradientScaler::new(precision))
        } else {
            StepStrategy::Unscaled
        }
    }

    pub fn scaler(&self) -> Option<&GradientScaler> {
        match self {
            StepStrategy::Scaled(scaler) => Some(scaler),
            StepStrategy::Unscaled => None,
        }
    }

    pub fn scaler_mut(&mut self) -> Option<&mut GradientScaler> {
        match self {
            StepStrategy::Scaled(scaler) => Some(scaler),
            StepStrategy::Unscaled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepOptions {
    pub seq_len: usize,
    pub accum_freq: usize,
    pub grad_clip_norm: Option<f64>,
    pub log_logit_mean: bool,
}

/// Outcome of one optimisation step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Sum of the per-chunk losses, each divided by the chunk count.
    pub loss: f64,
    pub chunks: usize,
    pub chunk_rows: usize,
    pub backward_passes: usize,
    pub optimizer_stepped: bool,
    /// Global gradient norm before clipping; infinite when the scaled path
    /// detected an overflow.
    pub grad_norm: f64,
    pub loss_scale: f32,
    pub batch_rows: usize,
    pub input_tokens: usize,
    pub logit_mean: Option<f64>,
}

/// Runs forward, backward and the optimizer for one batch.
#[derive(Debug)]
pub struct StepExecutor {
    autocast: Autocast,
    loss: CrossEntropyLoss,
    strategy: StepStrategy,
    options: StepOptions,
}

impl StepExecutor {
    pub fn new(
        precision: Precision,
        loss: CrossEntropyLoss,
        options: StepOptions,
    ) -> Result<Self> {
        if options.accum_freq == 0 {
            return Err(TrainingError::configuration("accum_freq must be at least 1"));
        }
        if let Some(max_norm) = options.grad_clip_norm {
            if !max_norm.is_finite() || max_norm <= 0.0 {
                return Err(TrainingError::configuration(format!(
                    "grad_clip_norm must be positive, got {}",
                    max_norm
                )));
            }
        }
        Ok(Self {
            autocast: precision.autocast(),
            loss,
            strategy: StepStrategy::for_precision(precision),
            options,
        })
    }

    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        let loss = CrossEntropyLoss::new().with_z_loss(config.runtime.z_loss_coefficient)?;
        Self::new(
            config.runtime.precision,
            loss,
            StepOptions {
                seq_len: config.data.seq_len,
                accum_freq: config.runtime.accum_freq,
                grad_clip_norm: config.optimizer.grad_clip_norm,
                log_logit_mean: config.runtime.log_logit_mean,
            },
        )
    }

    pub fn with_strategy(mut self, strategy: StepStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> &StepStrategy {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut StepStrategy {
        &mut self.strategy
    }

    pub fn options(&self) -> &StepOptions {
        &self.options
    }

    pub fn execute<M: LanguageModel>(
        &mut self,
        model: &ModelHandle<M>,
        batch: &TokenBatch,
        optimizer: &mut dyn Optimizer,
    ) -> Result<StepReport> {
        let accum_freq = self.options.accum_freq;
        let rows = batch.num_rows();
        if rows % accum_freq != 0 {
            return Err(TrainingError::configuration(format!(
                "batch of {} sequences is not divisible by accum_freq {}",
                rows, accum_freq
            )));
        }
        let chunk_rows = rows / accum_freq;

        let device = model.underlying().device().clone();
        let (inputs, targets) = batch.split(self.options.seq_len, &device)?;
        let params: Vec<Var> = model.parameters().into_iter().map(|(_, var)| var).collect();
        let tensors: Vec<Tensor> = params.iter().map(|var| var.as_tensor().clone()).collect();

        let mut accumulated: Option<GradStore> = None;
        let mut total_loss = 0f64;
        let mut logit_sum = 0f64;
        let mut backward_passes = 0usize;

        for chunk in 0..accum_freq {
            let chunk_inputs = inputs.narrow(0, chunk * chunk_rows, chunk_rows)?;
            let chunk_targets = targets.narrow(0, chunk * chunk_rows, chunk_rows)?;
            let log_logit_mean = self.options.log_logit_mean;
            let loss_fn = &self.loss;

            let (output, logit_mean) = self.autocast.scope(|ctx| {
                let logits = model.forward(&chunk_inputs, ctx)?;
                let logit_mean = if log_logit_mean {
                    Some(logits.mean_all()?.to_vec0::<f32>()? as f64)
                } else {
                    None
                };
                Ok((loss_fn.compute(&logits, &chunk_targets)?, logit_mean))
            })?;

            let chunk_loss = if accum_freq > 1 {
                output.loss.affine(1.0 / accum_freq as f64, 0.0)?
            } else {
                output.loss
            };
            total_loss += output.metrics.loss() / accum_freq as f64;
            logit_sum += logit_mean.unwrap_or(0.0);

            let backward_loss = match &self.strategy {
                StepStrategy::Scaled(scaler) => scaler.scale(&chunk_loss)?,
                StepStrategy::Unscaled => chunk_loss,
            };
            let grads = backward_loss.backward()?;
            backward_passes += 1;

            accumulated = Some(match accumulated {
                None => grads,
                Some(mut existing) => {
                    merge_gradient_store(&tensors, &mut existing, grads)?;
                    existing
                }
            });
        }

        let mut grads = accumulated
            .ok_or_else(|| TrainingError::runtime("no gradients were produced"))?;

        model.synchronize_gradients(&mut grads)?;

        let clip_collective: Option<&dyn Collective> = if model.is_sharded() {
            model.collective().map(|collective| collective.as_ref())
        } else {
            None
        };
        let overflow_collective = model.collective().map(|collective| collective.as_ref());

        let (optimizer_stepped, grad_norm) = match &mut self.strategy {
            StepStrategy::Scaled(scaler) => {
                let found_inf = scaler.unscale(&mut grads, &params, overflow_collective)?;
                let grad_norm = if found_inf {
                    f64::INFINITY
                } else {
                    clip_or_measure(&mut grads, &params, self.options.grad_clip_norm, clip_collective)?
                };
                let stepped = scaler.step(optimizer, &mut grads)?;
                scaler.update();
                (stepped, grad_norm)
            }
            StepStrategy::Unscaled => {
                let grad_norm =
                    clip_or_measure(&mut grads, &params, self.options.grad_clip_norm, clip_collective)?;
                optimizer.step(&mut grads)?;
                (true, grad_norm)
            }
        };

        if optimizer_stepped {
            model.after_optimizer_step()?;
        }

        Ok(StepReport {
            loss: total_loss,
            chunks: accum_freq,
            chunk_rows,
            backward_passes,
            optimizer_stepped,
            grad_norm,
            loss_scale: self
                .strategy
                .scaler()
                .map_or(1.0, GradientScaler::loss_scale),
            batch_rows: rows,
            input_tokens: inputs.elem_count(),
            logit_mean: self
                .options
                .log_logit_mean
                .then(|| logit_sum / accum_freq as f64),
        })
    }
}

fn clip_or_measure(
    grads: &mut GradStore,
    params: &[Var],
    max_norm: Option<f64>,
    collective: Option<&dyn Collective>,
) -> Result<f64> {
    match max_norm {
        Some(max_norm) => clip_grad_norm(grads, params, max_norm, collective),
        None => global_grad_norm(grads, params, collective),
    }
}

/// Adds the parameter gradients of `new_grads` into `accum`; gradients of
/// non-parameter tensors are dropped.
fn merge_gradient_store(
    parameters: &[Tensor],
    accum: &mut GradStore,
    mut new_grads: GradStore,
) -> Result<()> {
    for tensor in parameters {
        if let Some(grad) = new_grads.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BigramConfig, BigramLm};
    use crate::optimizer::{AdamW, AdamWConfig};
    use candle_core::Device;

    fn model() -> ModelHandle<BigramLm> {
        ModelHandle::Plain(
            BigramLm::new(
                &BigramConfig {
                    vocab_size: 16,
                    hidden_size: 8,
                    precision: Precision::Fp32,
                    seed: 1,
                },
                &Device::Cpu,
            )
            .unwrap(),
        )
    }

    fn batch(rows: usize, width: usize) -> TokenBatch {
        TokenBatch::new(
            (0..rows)
                .map(|r| (0..width).map(|c| ((r * 3 + c) % 16) as u32).collect())
                .collect(),
        )
        .unwrap()
    }

    fn options(accum_freq: usize) -> StepOptions {
        StepOptions {
            seq_len: 6,
            accum_freq,
            grad_clip_norm: Some(1.0),
            log_logit_mean: true,
        }
    }

    fn adamw(model: &ModelHandle<BigramLm>) -> AdamW {
        AdamW::new(
            model.parameters(),
            AdamWConfig {
                learning_rate: 1e-2,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.0,
            },
        )
        .unwrap()
    }

    #[test]
    fn reports_chunking_and_single_step() {
        let model = model();
        let mut optimizer = adamw(&model);
        let mut executor =
            StepExecutor::new(Precision::Fp32, CrossEntropyLoss::new(), options(2)).unwrap();
        let report = executor.execute(&model, &batch(4, 6), &mut optimizer).unwrap();

        assert_eq!(report.chunks, 2);
        assert_eq!(report.chunk_rows, 2);
        assert_eq!(report.backward_passes, 2);
        assert!(report.optimizer_stepped);
        assert_eq!(report.input_tokens, 4 * 5);
        assert_eq!(report.loss_scale, 1.0);
        assert!(report.logit_mean.is_some());
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn amp_selects_scaled_strategy() {
        let executor =
            StepExecutor::new(Precision::Amp, CrossEntropyLoss::new(), options(1)).unwrap();
        assert!(matches!(executor.strategy(), StepStrategy::Scaled(_)));
        let executor =
            StepExecutor::new(Precision::AmpBf16, CrossEntropyLoss::new(), options(1)).unwrap();
        assert!(matches!(executor.strategy(), StepStrategy::Unscaled));
    }

    #[test]
    fn rejects_zero_accumulation() {
        let err = StepExecutor::new(Precision::Fp32, CrossEntropyLoss::new(), options(0)).unwrap_err();
        assert!(err.is_configuration());
    }
}
