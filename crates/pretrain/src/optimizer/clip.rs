use candle_core::{backprop::GradStore, DType, Var};

use crate::{distributed::Collective, TrainingError};

const CLIP_EPS: f64 = 1e-6;

/// L2 norm over the gradients of `params` held in `grads`.
///
/// When the gradients are sharded, pass the collective: each worker
/// contributes the squared norm of its own shard and the total is summed
/// across workers, so every worker sees the norm of the full gradient.
pub fn global_grad_norm(
    grads: &GradStore,
    params: &[Var],
    collective: Option<&dyn Collective>,
) -> Result<f64, TrainingError> {
    let mut local = 0f64;
    for var in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_vec0::<f32>()?;
            local += sq as f64;
        }
    }
    let total = match collective {
        Some(collective) => collective.all_reduce_sum_f64(local)?,
        None => local,
    };
    Ok(total.sqrt())
}

/// Rescales gradients so their global norm does not exceed `max_norm`.
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(
    grads: &mut GradStore,
    params: &[Var],
    max_norm: f64,
    collective: Option<&dyn Collective>,
) -> Result<f64, TrainingError> {
    if !max_norm.is_finite() || max_norm <= 0.0 {
        return Err(TrainingError::configuration(format!(
            "grad_clip_norm must be positive, got {}",
            max_norm
        )));
    }

    let total_norm = global_grad_norm(grads, params, collective)?;
    let coefficient = max_norm / (total_norm + CLIP_EPS);
    if coefficient < 1.0 {
        for var in params {
            let tensor = var.as_tensor();
            let Some(grad) = grads.get(tensor) else {
                continue;
            };
            let clipped = grad.affine(coefficient, 0.0)?;
            grads.insert(tensor, clipped);
        }
    }
    Ok(total_norm)
}
