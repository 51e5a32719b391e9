use std::{fmt, str::FromStr};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{error::Result, TrainingError};

/// Numeric mode used for forward/backward computation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    /// Float16 autocast with dynamic loss scaling.
    Amp,
    /// Bfloat16 autocast; no loss scaling.
    #[serde(alias = "amp_bfloat16")]
    AmpBf16,
    /// Pure bfloat16 parameters.
    Bf16,
    /// Pure float16 parameters.
    Fp16,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Amp
    }
}

impl Precision {
    pub fn autocast(self) -> Autocast {
        let compute_dtype = match self {
            Precision::Amp => Some(DType::F16),
            Precision::AmpBf16 => Some(DType::BF16),
            Precision::Fp32 | Precision::Bf16 | Precision::Fp16 => None,
        };
        Autocast { compute_dtype }
    }

    pub fn parameter_dtype(self) -> DType {
        match self {
            Precision::Bf16 => DType::BF16,
            Precision::Fp16 => DType::F16,
            Precision::Fp32 | Precision::Amp | Precision::AmpBf16 => DType::F32,
        }
    }

    /// Whether this mode computes in bfloat16, which the CPU backend cannot
    /// multiply.
    pub fn uses_bf16(self) -> bool {
        matches!(self, Precision::AmpBf16 | Precision::Bf16)
    }

    /// Rejects modes the device has no kernels for.
    pub fn check_device(self, device: &Device) -> Result<()> {
        if self.uses_bf16() && device.is_cpu() {
            return Err(TrainingError::configuration(format!(
                "precision '{}' needs a cuda or metal device; the cpu backend has no bfloat16 matmul",
                self
            )));
        }
        Ok(())
    }

    pub fn uses_grad_scaler(self) -> bool {
        matches!(self, Precision::Amp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Amp => "amp",
            Precision::AmpBf16 => "amp_bf16",
            Precision::Bf16 => "bf16",
            Precision::Fp16 => "fp16",
        }
    }
}

impl FromStr for Precision {
    type Err = TrainingError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp32" => Ok(Precision::Fp32),
            "amp" => Ok(Precision::Amp),
            "amp_bf16" | "amp_bfloat16" => Ok(Precision::AmpBf16),
            "bf16" => Ok(Precision::Bf16),
            "fp16" => Ok(Precision::Fp16),
            other => Err(TrainingError::configuration(format!(
                "unrecognized precision '{}' (expected one of amp, amp_bf16, amp_bfloat16, bf16, fp16, fp32)",
                other
            ))),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activator for a reduced-precision compute region.
///
/// The context handed to the closure is the only way to reach the compute
/// dtype, so casts cannot leak past the end of [`Autocast::scope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Autocast {
    compute_dtype: Option<DType>,
}

impl Autocast {
    pub fn disabled() -> Self {
        Self {
            compute_dtype: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.compute_dtype.is_some()
    }

    pub fn scope<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&AutocastContext) -> Result<T>,
    {
        let ctx = AutocastContext {
            compute_dtype: self.compute_dtype,
        };
        body(&ctx)
    }
}

#[derive(Debug)]
pub struct AutocastContext {
    compute_dtype: Option<DType>,
}

impl AutocastContext {
    pub fn compute_dtype(&self) -> Option<DType> {
        self.compute_dtype
    }

    /// Casts a floating-point intermediate to the compute dtype.
    pub fn cast(&self, tensor: &Tensor) -> Result<Tensor> {
        match self.compute_dtype {
            Some(dtype) if tensor.dtype().is_float() && tensor.dtype() != dtype => {
                Ok(tensor.to_dtype(dtype)?)
            }
            _ => Ok(tensor.clone()),
        }
    }

    /// Returns a region output to float32 so losses are computed at full width.
    pub fn restore(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.compute_dtype.is_some() && tensor.dtype() != DType::F32 {
            Ok(tensor.to_dtype(DType::F32)?)
        } else {
            Ok(tensor.clone())
        }
    }
}
