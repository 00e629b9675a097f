//! AdamW with checkpointable state
//!
//! Moments are kept in float32 whatever the parameter dtype, so a core
//! sub-network cast to f16/bf16 still gets full-precision optimizer state.

use anyhow::Result;
use candle_core::{DType, Tensor, Var};
use std::collections::{BTreeMap, HashMap};

use crate::config::OptimizerConfig;

pub struct AdamW {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    warmup_steps: usize,

    // First and second moments, keyed by parameter name
    m: BTreeMap<String, Tensor>,
    v: BTreeMap<String, Tensor>,

    // Completed optimizer steps
    step: usize,
}

impl AdamW {
    pub fn new(learning_rate: f64, config: &OptimizerConfig) -> Self {
        Self {
            learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
            warmup_steps: config.warmup_steps,
            m: BTreeMap::new(),
            v: BTreeMap::new(),
            step: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Learning rate the next step will use, after warmup.
    pub fn current_lr(&self) -> f64 {
        warmup_lr(self.learning_rate, self.step, self.warmup_steps)
    }

    /// Apply one update to every parameter that has a gradient.
    pub fn step(&mut self, params: &[(String, Var)], grads: &BTreeMap<String, Tensor>) -> Result<()> {
        let lr = self.current_lr();
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step as i32);

        for (name, param) in params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;

            let m = match self.m.get(name) {
                Some(m) => ((m * self.beta1)? + (&grad * (1.0 - self.beta1))?)?,
                None => (&grad * (1.0 - self.beta1))?,
            };
            let v = match self.v.get(name) {
                Some(v) => ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?,
                None => (grad.sqr()? * (1.0 - self.beta2))?,
            };

            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;

            // Decoupled weight decay
            let theta = param.as_tensor().to_dtype(DType::F32)?;
            let theta = (theta * (1.0 - lr * self.weight_decay))?;
            let next = (theta - (update * lr)?)?;
            param.set(&next.to_dtype(param.dtype())?)?;

            self.m.insert(name.clone(), m);
            self.v.insert(name.clone(), v);
        }
        Ok(())
    }

    /// Moments as `(m, v)` per parameter, for checkpoints.
    pub fn state_tensors(&self) -> HashMap<String, (Tensor, Tensor)> {
        self.m
            .iter()
            .filter_map(|(name, m)| self.v.get(name).map(|v| (name.clone(), (m.clone(), v.clone()))))
            .collect()
    }

    pub fn load_state(&mut self, step: usize, state: HashMap<String, (Tensor, Tensor)>) -> Result<()> {
        self.m.clear();
        self.v.clear();
        for (name, (m, v)) in state {
            self.m.insert(name.clone(), m.to_dtype(DType::F32)?);
            self.v.insert(name, v.to_dtype(DType::F32)?);
        }
        self.step = step;
        Ok(())
    }
}

/// Learning rate for `step` with linear warmup over `warmup_steps`.
pub fn warmup_lr(base_lr: f64, step: usize, warmup_steps: usize) -> f64 {
    if warmup_steps == 0 || step >= warmup_steps {
        base_lr
    } else {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut BTreeMap<String, Tensor>, max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for grad in grads.values() {
        total += grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    let norm = total.sqrt();
    if norm > max_norm && norm.is_finite() {
        let factor = max_norm / (norm + 1e-6);
        for grad in grads.values_mut() {
            *grad = grad.affine(factor, 0.0)?;
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn optimizer_config() -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            warmup_steps: 0,
        }
    }

    #[test]
    fn test_step_moves_against_gradient() -> Result<()> {
        let device = Device::Cpu;
        let param = Var::from_tensor(&Tensor::new(&[1f32, -1.0], &device)?)?;
        let params = vec![("w".to_string(), param.clone())];
        let mut grads = BTreeMap::new();
        grads.insert("w".to_string(), Tensor::new(&[0.5f32, -0.5], &device)?);

        let mut opt = AdamW::new(0.1, &optimizer_config());
        opt.step(&params, &grads)?;

        let values = param.as_tensor().to_vec1::<f32>()?;
        // first Adam step moves each weight by ~lr in the sign of -grad
        assert!((values[0] - 0.9).abs() < 1e-4);
        assert!((values[1] + 0.9).abs() < 1e-4);
        assert_eq!(opt.step_count(), 1);
        assert_eq!(opt.state_tensors().len(), 1);
        Ok(())
    }

    #[test]
    fn test_half_precision_parameters_keep_dtype() -> Result<()> {
        let device = Device::Cpu;
        let param = Var::from_tensor(&Tensor::new(&[1f32, 2.0], &device)?.to_dtype(DType::F16)?)?;
        let params = vec![("w".to_string(), param.clone())];
        let mut grads = BTreeMap::new();
        grads.insert("w".to_string(), Tensor::new(&[1f32, 1.0], &device)?.to_dtype(DType::F16)?);

        let mut opt = AdamW::new(0.01, &optimizer_config());
        opt.step(&params, &grads)?;
        assert_eq!(param.dtype(), DType::F16);
        let state = opt.state_tensors();
        let (m, _) = &state["w"];
        assert_eq!(m.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_clip_grad_norm() -> Result<()> {
        let device = Device::Cpu;
        let mut grads = BTreeMap::new();
        grads.insert("a".to_string(), Tensor::new(&[3f32, 4.0], &device)?);

        let norm = clip_grad_norm(&mut grads, 1.0)?;
        assert!((norm - 5.0).abs() < 1e-6);
        let clipped = grads["a"].to_vec1::<f32>()?;
        assert!((clipped[0] - 0.6).abs() < 1e-4);
        assert!((clipped[1] - 0.8).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_warmup_scales_first_steps() -> Result<()> {
        let device = Device::Cpu;
        let param = Var::from_tensor(&Tensor::new(&[0f32], &device)?)?;
        let params = vec![("w".to_string(), param.clone())];
        let mut grads = BTreeMap::new();
        grads.insert("w".to_string(), Tensor::new(&[1f32], &device)?);

        let mut config = optimizer_config();
        config.warmup_steps = 4;
        let mut opt = AdamW::new(0.4, &config);
        assert!((opt.current_lr() - 0.1).abs() < 1e-12);
        opt.step(&params, &grads)?;
        assert!((param.as_tensor().to_vec1::<f32>()?[0] + 0.1).abs() < 1e-4);
        assert!((opt.current_lr() - 0.2).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_warmup_lr() {
        assert_eq!(warmup_lr(1.0, 0, 0), 1.0);
        assert_eq!(warmup_lr(1.0, 0, 4), 0.25);
        assert_eq!(warmup_lr(1.0, 3, 4), 1.0);
        assert_eq!(warmup_lr(1.0, 10, 4), 1.0);
    }
}
