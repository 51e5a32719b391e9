use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{distributed::Collective, optimizer::Optimizer, precision::Precision, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(16),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

/// Dynamic loss scaling for float16 autocast.
///
/// Each optimisation step follows the same protocol: [`scale`] the loss before
/// backward, [`unscale`] the gradients (recording whether any were non-finite),
/// [`step`] the optimizer (skipped on overflow), then [`update`] the scale.
///
/// [`scale`]: GradientScaler::scale
/// [`unscale`]: GradientScaler::unscale
/// [`step`]: GradientScaler::step
/// [`update`]: GradientScaler::update
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f32,
    growth_tracker: usize,
    found_inf: Option<bool>,
    config: LossScaleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradientScalerState {
    pub scale: f32,
    pub growth_tracker: usize,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if !precision.uses_grad_scaler() {
            return Self {
                state: ScalerState::Disabled,
            };
        }

        let config = sanitize_config(config);
        Self {
            state: ScalerState::Enabled(EnabledState {
                loss_scale: config.initial_scale,
                growth_tracker: 0,
                found_inf: None,
                config,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(loss.clone()),
            ScalerState::Enabled(state) => Ok(loss.affine(state.loss_scale as f64, 0.0)?),
        }
    }

    /// Divides every gradient of `params` by the current scale in place and
    /// records whether any of them overflowed. With a collective the overflow
    /// decision is shared so that all workers skip together.
    pub fn unscale(
        &mut self,
        grads: &mut GradStore,
        params: &[Var],
        collective: Option<&dyn Collective>,
    ) -> Result<bool, TrainingError> {
        let ScalerState::Enabled(state) = &mut self.state else {
            return Ok(false);
        };
        if state.found_inf.is_some() {
            return Err(TrainingError::runtime(
                "gradients were already unscaled for this step",
            ));
        }

        let inv_scale = 1.0 / state.loss_scale as f64;
        let mut found_inf = false;
        for var in params {
            let tensor = var.as_tensor();
            let Some(grad) = grads.get(tensor) else {
                continue;
            };
            let unscaled = grad.affine(inv_scale, 0.0)?;
            if !found_inf && contains_non_finite(&unscaled)? {
                found_inf = true;
            }
            grads.insert(tensor, unscaled);
        }

        if let Some(collective) = collective {
            found_inf = collective.any(found_inf)?;
        }
        state.found_inf = Some(found_inf);
        Ok(found_inf)
    }

    /// Runs the optimizer unless the unscaled gradients overflowed. Returns
    /// whether the optimizer stepped.
    pub fn step(
        &mut self,
        optimizer: &mut dyn Optimizer,
        grads: &mut GradStore,
    ) -> Result<bool, TrainingError> {
        match &self.state {
            ScalerState::Disabled => {
                optimizer.step(grads)?;
                Ok(true)
            }
            ScalerState::Enabled(state) => match state.found_inf {
                None => Err(TrainingError::runtime(
                    "scaler step requires gradients to be unscaled first",
                )),
                Some(true) => Ok(false),
                Some(false) => {
                    optimizer.step(grads)?;
                    Ok(true)
                }
            },
        }
    }

    /// Adjusts the scale from the overflow flag of the step just taken.
    pub fn update(&mut self) {
        let ScalerState::Enabled(state) = &mut self.state else {
            return;
        };
        let found_inf = state.found_inf.take().unwrap_or(false);
        if found_inf {
            state.loss_scale *= state.config.backoff_factor;
            state.growth_tracker = 0;
            debug!(scale = state.loss_scale, "gradient overflow, reducing loss scale");
        } else {
            state.growth_tracker += 1;
            if state.growth_tracker >= state.config.growth_interval {
                state.loss_scale *= state.config.growth_factor;
                state.growth_tracker = 0;
            }
        }
    }

    pub fn state(&self) -> Option<GradientScalerState> {
        match &self.state {
            ScalerState::Disabled => None,
            ScalerState::Enabled(state) => Some(GradientScalerState {
                scale: state.loss_scale,
                growth_tracker: state.growth_tracker,
            }),
        }
    }

    pub fn load_state(&mut self, saved: GradientScalerState) -> Result<(), TrainingError> {
        let ScalerState::Enabled(state) = &mut self.state else {
            return Err(TrainingError::runtime(
                "cannot restore loss-scale state into a disabled scaler",
            ));
        };
        if !saved.scale.is_finite() || saved.scale <= 0.0 {
            return Err(TrainingError::runtime(format!(
                "invalid saved loss scale {}",
                saved.scale
            )));
        }
        state.loss_scale = saved.scale;
        state.growth_tracker = saved.growth_tracker;
        state.found_inf = None;
        Ok(())
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)?
        .abs()?
        .sum_all()?
        .to_vec0::<f32>()?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) || config.backoff_factor == 0.0 {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if !config.initial_scale.is_finite() || config.initial_scale <= 0.0 {
        config.initial_scale = LossScaleConfig::default().initial_scale;
    }
    config
}
