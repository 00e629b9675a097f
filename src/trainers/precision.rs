//! Numeric precision and how the trainer applies it
//!
//! `PrecisionPolicy` is handed to the trainer at construction. `Mixed` keeps
//! float32 master weights, computes in reduced precision and scales the loss
//! for float16. `Direct` casts the model's core sub-network once and trains in
//! that dtype without loss scaling.

use anyhow::Result;
use candle_core::{DType, Tensor, Var};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use super::module::TrainableModule;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    /// `32`
    #[default]
    Full,
    /// `16`
    Half,
    /// `bf16`
    BFloat16,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Precision::Full => DType::F32,
            Precision::Half => DType::F16,
            Precision::BFloat16 => DType::BF16,
        }
    }

    /// Parse the values accepted in `trainer.precision`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "32" | "32-true" => Some(Precision::Full),
            "16" | "16-mixed" => Some(Precision::Half),
            "bf16" | "bf16-mixed" => Some(Precision::BFloat16),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Full => write!(f, "32"),
            Precision::Half => write!(f, "16"),
            Precision::BFloat16 => write!(f, "bf16"),
        }
    }
}

impl Serialize for Precision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Precision::Full => serializer.serialize_u64(32),
            Precision::Half => serializer.serialize_u64(16),
            Precision::BFloat16 => serializer.serialize_str("bf16"),
        }
    }
}

impl<'de> Deserialize<'de> for Precision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Int(value) => value.to_string(),
            Raw::Str(value) => value,
        };
        Precision::parse(&text).ok_or_else(|| {
            de::Error::custom(format!(
                "unsupported precision {:?}, expected 32, 16 or bf16",
                text
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionPolicy {
    /// Automatic mixed precision.
    Mixed(Precision),
    /// Parameters are cast to the precision directly.
    Direct(Precision),
}

impl PrecisionPolicy {
    pub fn from_config(precision: Precision, force_disable_amp: bool) -> Self {
        if force_disable_amp {
            PrecisionPolicy::Direct(precision)
        } else {
            PrecisionPolicy::Mixed(precision)
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            PrecisionPolicy::Mixed(p) | PrecisionPolicy::Direct(p) => *p,
        }
    }

    /// Dtype the forward pass runs in.
    pub fn compute_dtype(&self) -> DType {
        self.precision().dtype()
    }

    pub fn uses_loss_scaling(&self) -> bool {
        matches!(self, PrecisionPolicy::Mixed(Precision::Half))
    }

    /// Dtype the core sub-network is cast to, if any.
    pub fn parameter_dtype(&self) -> Option<DType> {
        match self {
            PrecisionPolicy::Direct(Precision::Half) => Some(DType::F16),
            PrecisionPolicy::Direct(Precision::BFloat16) => Some(DType::BF16),
            _ => None,
        }
    }

    /// Cast the model's core sub-network for the direct policy.
    pub fn apply<M: TrainableModule + ?Sized>(&self, model: &mut M) -> Result<()> {
        match self.parameter_dtype() {
            Some(dtype) => {
                log::info!("Casting core sub-network to {:?}", dtype);
                model.cast_core(dtype)
            }
            None => {
                log::debug!("Precision {} needs no parameter cast", self.precision());
                Ok(())
            }
        }
    }
}

/// Dynamic loss scaling for float16 mixed precision.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
    warned_half_params: bool,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
            warned_half_params: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    pub fn set_scale(&mut self, scale: f64) {
        if scale.is_finite() && scale > 0.0 {
            self.scale = scale;
        }
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.scale, 0.0)?)
    }

    /// Divide gradients by the scale. Returns true when any gradient is not finite.
    pub fn unscale(
        &mut self,
        grads: &mut BTreeMap<String, Tensor>,
        params: &[(String, Var)],
    ) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        if !self.warned_half_params && params.iter().any(|(_, v)| v.dtype() == DType::F16) {
            log::warn!("Attempting to unscale FP16 gradients");
            self.warned_half_params = true;
        }

        let inv_scale = 1.0 / self.scale;
        let mut found_inf = false;
        for grad in grads.values_mut() {
            let unscaled = grad.to_dtype(DType::F32)?.affine(inv_scale, 0.0)?;
            let sum_sq = unscaled.sqr()?.sum_all()?.to_scalar::<f32>()?;
            if !sum_sq.is_finite() {
                found_inf = true;
            }
            *grad = unscaled;
        }
        Ok(found_inf)
    }

    /// Back off after an overflow, grow after `growth_interval` clean steps.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }
}
