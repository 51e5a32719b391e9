use std::collections::HashMap;

pub mod clip;
pub mod scaler;

pub use clip::{clip_grad_norm, global_grad_norm};
pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

/// Parameter update rule driven by the step executor.
pub trait Optimizer {
    /// Consumes the gradients in `grads` and updates the parameters they
    /// belong to. Parameters without a gradient are left untouched.
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Number of updates applied so far.
    fn steps_taken(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

/// Decoupled-weight-decay Adam with float32 moments and optional float32
/// master copies for reduced-precision parameters.
#[derive(Debug)]
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl AdamW {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let dtype = tensor.dtype();
            let first_moment = Tensor::zeros(tensor.shape(), DType::F32, device)?;
            let second_moment = Tensor::zeros(tensor.shape(), DType::F32, device)?;
            let apply_weight_decay = decays(&name, tensor.rank());

            let master = if dtype != DType::F32 {
                Some(Var::from_tensor(&tensor.to_dtype(DType::F32)?)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn config(&self) -> AdamWConfig {
        self.config
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let master = match &slot.master {
                Some(master) => Some(flatten(master.as_tensor())?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten(&slot.first_moment)?,
                second_moment: flatten(&slot.second_moment)?,
                master,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let tensor = slot.param.as_tensor();
            if tensor.dims() != saved.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }

            let device = tensor.device();
            slot.first_moment = Tensor::from_vec(saved.first_moment, tensor.shape(), device)?;
            slot.second_moment = Tensor::from_vec(saved.second_moment, tensor.shape(), device)?;

            match (&slot.master, saved.master) {
                (Some(master), Some(values)) => {
                    master.set(&Tensor::from_vec(values, tensor.shape(), device)?)?;
                }
                (None, None) => {}
                _ => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state master weights for '{}' do not match parameter dtype",
                        slot.name
                    )))
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        self.step = state.step;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }

    /// Re-reads master weights from the parameters for every slot selected by
    /// `stale`. Used for parameters updated on another worker and copied in.
    pub fn refresh_masters(
        &mut self,
        stale: impl Fn(usize) -> bool,
    ) -> Result<(), TrainingError> {
        for (index, slot) in self.params.iter().enumerate() {
            if let (true, Some(master)) = (stale(index), slot.master.as_ref()) {
                master.set(&slot.param.as_tensor().to_dtype(DType::F32)?)?;
            }
        }
        Ok(())
    }

    fn update_slot(
        config: &AdamWConfig,
        step: usize,
        slot: &mut ParameterSlot,
        grad: Tensor,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - config.beta1.powi(step as i32);
        let bias_correction2 = 1.0 - config.beta2.powi(step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        let grad = grad.to_dtype(DType::F32)?;
        let new_m = slot
            .first_moment
            .affine(config.beta1, 0.0)?
            .add(&grad.affine(1.0 - config.beta1, 0.0)?)?;
        let new_v = slot
            .second_moment
            .affine(config.beta2, 0.0)?
            .add(&grad.sqr()?.affine(1.0 - config.beta2, 0.0)?)?;

        let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, config.epsilon)?;
        let update = new_m
            .affine(scale_m, 0.0)?
            .div(&denom)?
            .affine(config.learning_rate, 0.0)?;

        let base = match slot.master.as_ref() {
            Some(master) => master.as_tensor().clone(),
            None => slot.param.as_tensor().to_dtype(DType::F32)?,
        };
        let decayed = if slot.apply_weight_decay && config.weight_decay != 0.0 {
            base.affine(1.0 - config.learning_rate * config.weight_decay, 0.0)?
        } else {
            base
        };
        let next = decayed.sub(&update)?;

        if let Some(master) = slot.master.as_ref() {
            master.set(&next)?;
        }
        slot.param.set(&next.to_dtype(slot.dtype)?)?;
        slot.first_moment = new_m;
        slot.second_moment = new_v;
        Ok(())
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut pending = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                pending.push((index, grad));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        self.step += 1;
        for (index, grad) in pending {
            Self::update_slot(&self.config, self.step, &mut self.params[index], grad)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    fn steps_taken(&self) -> usize {
        self.step
    }
}

/// Gains, biases, normalisation and embedding tables are not decayed.
fn decays(name: &str, rank: usize) -> bool {
    const EXCLUDED: [&str; 5] = ["bn", "ln", "bias", "embed", "norm"];
    rank >= 2 && !EXCLUDED.iter().any(|pattern| name.contains(pattern))
}

fn flatten(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    Ok(tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn config(weight_decay: f64) -> AdamWConfig {
        AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
        }
    }

    fn loss_grads(var: &Var) -> GradStore {
        var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap()
    }

    #[test]
    fn first_step_moves_against_gradient_sign() {
        let var = Var::from_tensor(&Tensor::new(&[[1.0f32, -2.0]], &Device::Cpu).unwrap()).unwrap();
        let mut optimizer = AdamW::new(vec![("w".into(), var.clone())], config(0.0)).unwrap();
        let mut grads = loss_grads(&var);
        optimizer.step(&mut grads).unwrap();

        let values = var.as_tensor().to_vec2::<f32>().unwrap();
        assert_relative_eq!(values[0][0], 0.9, epsilon = 1e-4);
        assert_relative_eq!(values[0][1], -1.9, epsilon = 1e-4);
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn bias_and_vectors_skip_weight_decay() {
        assert!(decays("head.weight", 2));
        assert!(!decays("head.bias", 1));
        assert!(!decays("embed.weight", 2));
        assert!(!decays("block.ln_1.weight", 2));
        assert!(!decays("scale", 1));
    }

    #[test]
    fn step_without_gradients_is_noop() {
        let var = Var::from_tensor(&Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap()).unwrap();
        let other = Var::from_tensor(&Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap()).unwrap();
        let mut optimizer = AdamW::new(vec![("w".into(), var.clone())], config(0.2)).unwrap();
        let mut grads = loss_grads(&other);
        optimizer.step(&mut grads).unwrap();
        assert_eq!(optimizer.steps_taken(), 0);
        assert_eq!(var.as_tensor().to_vec2::<f32>().unwrap(), vec![vec![1.0]]);
    }

    #[test]
    fn state_round_trip_restores_moments() {
        let var = Var::from_tensor(&Tensor::new(&[[0.5f32, 0.25]], &Device::Cpu).unwrap()).unwrap();
        let mut optimizer = AdamW::new(vec![("w".into(), var.clone())], config(0.1)).unwrap();
        let mut grads = loss_grads(&var);
        optimizer.step(&mut grads).unwrap();
        optimizer.set_learning_rate(0.01);
        let state = optimizer.state().unwrap();

        let mut restored = AdamW::new(vec![("w".into(), var.clone())], config(0.1)).unwrap();
        restored.load_state(state.clone()).unwrap();
        let again = restored.state().unwrap();
        assert_eq!(again.step, 1);
        assert_eq!(restored.learning_rate(), 0.01);
        assert_eq!(again.parameters[0].first_moment, state.parameters[0].first_moment);
    }

    #[test]
    fn refreshed_master_follows_copied_in_parameter() {
        let device = Device::Cpu;
        let half = |value: f32| {
            Tensor::new(&[value, value], &device)
                .unwrap()
                .to_dtype(DType::F16)
                .unwrap()
        };
        let kept = Var::from_tensor(&half(1.0)).unwrap();
        let copied = Var::from_tensor(&half(1.0)).unwrap();
        let mut optimizer = AdamW::new(
            vec![("a".into(), kept.clone()), ("b".into(), copied.clone())],
            config(0.0),
        )
        .unwrap();

        kept.set(&half(3.0)).unwrap();
        copied.set(&half(2.0)).unwrap();
        optimizer.refresh_masters(|index| index == 1).unwrap();

        let state = optimizer.state().unwrap();
        assert_eq!(state.parameters[0].master, Some(vec![1.0, 1.0]));
        assert_eq!(state.parameters[1].master, Some(vec![2.0, 2.0]));
    }
}
