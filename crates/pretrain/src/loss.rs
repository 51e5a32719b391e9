use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Token-level cross entropy with an optional z-loss penalty on the
/// log-partition function.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    z_loss_coefficient: f64,
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_z_loss(mut self, coefficient: f64) -> Result<Self, TrainingError> {
        if !coefficient.is_finite() || coefficient < 0.0 {
            return Err(TrainingError::configuration(
                "z-loss coefficient must be a finite value >= 0",
            ));
        }
        self.z_loss_coefficient = coefficient;
        Ok(self)
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn z_loss_coefficient(&self) -> f64 {
        self.z_loss_coefficient
    }

    /// Mean loss over all (non-ignored) target tokens.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }

        let vocab_size = *dims
            .last()
            .ok_or_else(|| TrainingError::runtime("logits tensor missing vocabulary dimension"))?;
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }

        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(TrainingError::runtime(format!(
                "target shape {:?} does not match logits shape {:?}",
                targets.dims(),
                dims
            )));
        }

        let token_count: usize = token_dims.iter().product();
        if token_count == 0 {
            return Err(TrainingError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let device = logits.device();
        let logits_flat = logits
            .to_dtype(DType::F32)
            .and_then(|t| t.reshape((token_count, vocab_size)))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_flat = targets
            .to_device(device)
            .and_then(|t| t.reshape((token_count,)))
            .map_err(to_runtime_error)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let valid_mask = match self.ignore_index {
            Some(ignore_index) => targets_flat
                .ne(ignore_index)
                .and_then(|mask| mask.to_dtype(DType::F32))
                .map_err(to_runtime_error)?,
            None => Tensor::ones((token_count,), DType::F32, device).map_err(to_runtime_error)?,
        };
        let total_tokens = valid_mask
            .sum_all()
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)?
            .round() as usize;
        if total_tokens == 0 {
            return Err(TrainingError::runtime(
                "no valid tokens remain after applying ignore_index",
            ));
        }

        let nll = log_probs
            .gather(&targets_flat.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .and_then(|t| t.neg())
            .and_then(|t| t.squeeze(1))
            .map_err(to_runtime_error)?;

        let per_token = if self.z_loss_coefficient > 0.0 {
            let lse = log_sum_exp(&logits_flat)?;
            let z_term = lse
                .sqr()
                .and_then(|t| t.affine(self.z_loss_coefficient, 0.0))
                .map_err(to_runtime_error)?;
            (&nll + &z_term).map_err(to_runtime_error)?
        } else {
            nll.clone()
        };

        let inv_tokens = 1f64 / total_tokens as f64;
        let loss = (&per_token * &valid_mask)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.affine(inv_tokens, 0.0))
            .map_err(to_runtime_error)?;
        let cross_entropy = (&nll * &valid_mask)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.affine(inv_tokens, 0.0))
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)?;
        let loss_value = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                loss: loss_value as f64,
                cross_entropy: cross_entropy as f64,
                total_tokens,
            },
        })
    }
}

fn log_sum_exp(logits: &Tensor) -> Result<Tensor, TrainingError> {
    let max = logits.max_keepdim(D::Minus1).map_err(to_runtime_error)?;
    logits
        .broadcast_sub(&max)
        .and_then(|t| t.exp())
        .and_then(|t| t.sum_keepdim(D::Minus1))
        .and_then(|t| t.log())
        .and_then(|t| t.broadcast_add(&max))
        .and_then(|t| t.squeeze(D::Minus1))
        .map_err(to_runtime_error)
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    loss: f64,
    cross_entropy: f64,
    total_tokens: usize,
}

impl LossMetrics {
    /// Optimized objective, including any z-loss term.
    pub fn loss(&self) -> f64 {
        self.loss
    }

    pub fn cross_entropy(&self) -> f64 {
        self.cross_entropy
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn perplexity(&self) -> f64 {
        self.cross_entropy.exp()
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
