//! DDPM noise schedule
//! Forward noising for training and deterministic DDIM steps for sampling

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use rand::Rng;

pub struct DDPMScheduler {
    num_timesteps: usize,

    // Precomputed values
    alphas_cumprod: Vec<f32>,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DDPMScheduler {
    pub fn new(
        num_timesteps: usize,
        beta_start: f32,
        beta_end: f32,
        beta_schedule: &str,
        device: &Device,
    ) -> Result<Self> {
        if num_timesteps < 2 {
            bail!("num_train_timesteps must be at least 2, got {}", num_timesteps);
        }

        // Generate beta schedule
        let betas = match beta_schedule {
            "linear" => Self::linear_beta_schedule(num_timesteps, beta_start, beta_end),
            "scaled_linear" => Self::scaled_linear_beta_schedule(num_timesteps, beta_start, beta_end),
            "squaredcos_cap_v2" => Self::cosine_beta_schedule(num_timesteps),
            other => bail!("unknown beta schedule: {}", other),
        };

        let mut alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut running = 1.0f32;
        for beta in betas {
            running *= 1.0 - beta;
            alphas_cumprod.push(running);
        }

        let sqrt_alphas: Vec<f32> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus: Vec<f32> = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        Ok(Self {
            num_timesteps,
            sqrt_alphas_cumprod: Tensor::from_vec(sqrt_alphas, num_timesteps, device)?,
            sqrt_one_minus_alphas_cumprod: Tensor::from_vec(sqrt_one_minus, num_timesteps, device)?,
            alphas_cumprod,
        })
    }

    /// Add noise to samples
    pub fn add_noise(
        &self,
        original_samples: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let batch_size = timesteps.dims()[0];

        // index_select expects integer indices
        let timesteps = timesteps.to_dtype(DType::U32)?;
        let sqrt_alpha_prod = self.sqrt_alphas_cumprod.index_select(&timesteps, 0)?;
        let sqrt_one_minus_alpha_prod = self.sqrt_one_minus_alphas_cumprod.index_select(&timesteps, 0)?;

        // [batch_size] -> [batch_size, 1, 1, 1] to broadcast over [batch_size, C, H, W]
        let sqrt_alpha_prod = sqrt_alpha_prod
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(original_samples.dtype())?;
        let sqrt_one_minus_alpha_prod = sqrt_one_minus_alpha_prod
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(original_samples.dtype())?;

        let scaled_original = sqrt_alpha_prod.broadcast_mul(original_samples)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// Signal-to-noise ratio per timestep.
    pub fn snr(&self, timesteps: &[u32]) -> Vec<f32> {
        timesteps
            .iter()
            .map(|&t| {
                let a = self.alphas_cumprod[t as usize];
                a / (1.0 - a)
            })
            .collect()
    }

    /// Sample random timesteps
    pub fn sample_timesteps<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<u32> {
        (0..batch_size)
            .map(|_| rng.gen_range(0..self.num_timesteps) as u32)
            .collect()
    }

    /// Evenly spaced timesteps for `num_inference_steps`, highest first.
    pub fn inference_timesteps(&self, num_inference_steps: usize) -> Vec<usize> {
        let steps = num_inference_steps.clamp(1, self.num_timesteps);
        let ratio = self.num_timesteps / steps;
        (0..steps).rev().map(|i| i * ratio).collect()
    }

    /// One deterministic DDIM update from `timestep` to `prev_timestep`
    /// (`None` means the clean sample).
    pub fn ddim_step(
        &self,
        model_output: &Tensor,
        timestep: usize,
        prev_timestep: Option<usize>,
        sample: &Tensor,
    ) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep] as f64;
        let alpha_prod_prev = prev_timestep
            .map(|t| self.alphas_cumprod[t] as f64)
            .unwrap_or(1.0);

        // x0 = (x_t - sqrt(1 - a_t) * eps) / sqrt(a_t)
        let pred_original = ((sample - (model_output * (1.0 - alpha_prod_t).sqrt())?)?
            / alpha_prod_t.sqrt())?
            .clamp(-1f32, 1f32)?;

        // x_prev = sqrt(a_prev) * x0 + sqrt(1 - a_prev) * eps
        let direction = (model_output * (1.0 - alpha_prod_prev).sqrt())?;
        Ok(((pred_original * alpha_prod_prev.sqrt())? + direction)?)
    }

    // Beta schedule functions
    fn linear_beta_schedule(num_timesteps: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        (0..num_timesteps)
            .map(|i| beta_start + (beta_end - beta_start) * (i as f32) / (num_timesteps as f32 - 1.0))
            .collect()
    }

    fn scaled_linear_beta_schedule(num_timesteps: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        (0..num_timesteps)
            .map(|i| {
                let t = start + (end - start) * (i as f32) / (num_timesteps as f32 - 1.0);
                t * t
            })
            .collect()
    }

    fn cosine_beta_schedule(num_timesteps: usize) -> Vec<f32> {
        let s = 0.008;
        let alpha_bar = |t: f32| ((t + s) / (1.0 + s) * std::f32::consts::PI / 2.0).cos().powi(2);

        (0..num_timesteps)
            .map(|i| {
                let t1 = i as f32 / num_timesteps as f32;
                let t2 = (i + 1) as f32 / num_timesteps as f32;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
            })
            .collect()
    }

    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }
}

/// Min-SNR loss weighting: min(snr, gamma) / snr
pub fn compute_snr_loss_weights(snr: &[f32], gamma: f32) -> Vec<f32> {
    snr.iter().map(|&s| s.min(gamma) / s.max(f32::EPSILON)).collect()
}
