//! Pixel-space denoiser
//!
//! conv_in -> residual blocks conditioned on an embedding -> conv_out. Weights
//! live in a name-keyed map and the forward pass is written functionally over
//! that map, so the whole network can be cast or reloaded by name.

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::GroupNorm;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};

const IMAGE_CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenoiserConfig {
    pub base_channels: usize,
    pub num_blocks: usize,
}

impl DenoiserConfig {
    fn norm_groups(&self) -> usize {
        [8, 4, 2, 1]
            .into_iter()
            .find(|g| self.base_channels % g == 0)
            .unwrap_or(1)
    }
}

pub struct Denoiser {
    config: DenoiserConfig,
    params: BTreeMap<String, Var>,
}

impl Denoiser {
    pub fn new(config: DenoiserConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        if config.base_channels == 0 {
            bail!("model.base_channels must be positive");
        }
        let c = config.base_channels;
        let mut params = BTreeMap::new();
        let mut add = |name: String, shape: &[usize], fan_in: usize, rng: &mut StdRng| -> Result<()> {
            params.insert(name, uniform_var(shape, fan_in, device, rng)?);
            Ok(())
        };

        add("time_proj.weight".into(), &[c, c], c, rng)?;
        add("time_proj.bias".into(), &[c], c, rng)?;
        add("conv_in.weight".into(), &[c, IMAGE_CHANNELS, 3, 3], IMAGE_CHANNELS * 9, rng)?;
        add("conv_in.bias".into(), &[c], IMAGE_CHANNELS * 9, rng)?;
        for i in 0..config.num_blocks {
            add(format!("blocks.{}.conv1.weight", i), &[c, c, 3, 3], c * 9, rng)?;
            add(format!("blocks.{}.conv1.bias", i), &[c], c * 9, rng)?;
            add(format!("blocks.{}.emb_proj.weight", i), &[c, c], c, rng)?;
            add(format!("blocks.{}.emb_proj.bias", i), &[c], c, rng)?;
            add(format!("blocks.{}.conv2.weight", i), &[c, c, 3, 3], c * 9, rng)?;
            add(format!("blocks.{}.conv2.bias", i), &[c], c * 9, rng)?;
        }
        add("conv_out.weight".into(), &[IMAGE_CHANNELS, c, 3, 3], c * 9, rng)?;
        add("conv_out.bias".into(), &[IMAGE_CHANNELS], c * 9, rng)?;

        for i in 0..config.num_blocks {
            for norm in ["norm1", "norm2"] {
                params.insert(
                    format!("blocks.{}.{}.weight", i, norm),
                    Var::from_tensor(&Tensor::ones(c, DType::F32, device)?)?,
                );
                params.insert(
                    format!("blocks.{}.{}.bias", i, norm),
                    Var::from_tensor(&Tensor::zeros(c, DType::F32, device)?)?,
                );
            }
        }

        Ok(Self { config, params })
    }

    pub fn config(&self) -> DenoiserConfig {
        self.config
    }

    pub fn params(&self) -> &BTreeMap<String, Var> {
        &self.params
    }

    /// Replace every weight with a copy in `dtype`.
    pub fn cast(&mut self, dtype: DType) -> Result<()> {
        for var in self.params.values_mut() {
            if var.dtype() != dtype {
                *var = Var::from_tensor(&var.as_tensor().to_dtype(dtype)?)?;
            }
        }
        Ok(())
    }

    /// Overwrite weights from `tensors`, looking up `prefix` + name. Returns
    /// how many weights were found.
    pub fn load(&mut self, tensors: &HashMap<String, Tensor>, prefix: &str) -> Result<usize> {
        let mut loaded = 0;
        for (name, var) in &self.params {
            let Some(tensor) = tensors.get(&format!("{}{}", prefix, name)) else {
                continue;
            };
            if tensor.dims() != var.dims() {
                bail!(
                    "Shape mismatch for {}{}: expected {:?}, got {:?}",
                    prefix,
                    name,
                    var.dims(),
                    tensor.dims()
                );
            }
            var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    fn weight(&self, name: &str, dtype: DType) -> Result<Tensor> {
        let var = self
            .params
            .get(name)
            .ok_or_else(|| anyhow!("Missing denoiser weight: {}", name))?;
        Ok(var.as_tensor().to_dtype(dtype)?)
    }

    fn linear(&self, x: &Tensor, prefix: &str, dtype: DType) -> Result<Tensor> {
        let w = self.weight(&format!("{}.weight", prefix), dtype)?;
        let b = self.weight(&format!("{}.bias", prefix), dtype)?;
        Ok(x.matmul(&w.t()?)?.broadcast_add(&b)?)
    }

    fn conv(&self, x: &Tensor, prefix: &str, dtype: DType) -> Result<Tensor> {
        let w = self.weight(&format!("{}.weight", prefix), dtype)?;
        let b = self.weight(&format!("{}.bias", prefix), dtype)?;
        let out = x.conv2d(&w, 1, 1, 1, 1)?;
        let b = b.reshape((1, b.dims1()?, 1, 1))?;
        Ok(out.broadcast_add(&b)?)
    }

    fn norm(&self, x: &Tensor, prefix: &str, dtype: DType) -> Result<Tensor> {
        let w = self.weight(&format!("{}.weight", prefix), dtype)?;
        let b = self.weight(&format!("{}.bias", prefix), dtype)?;
        let norm = GroupNorm::new(w, b, self.config.base_channels, self.config.norm_groups(), 1e-5)?;
        Ok(norm.forward(x)?)
    }

    /// Predict the noise in `x` (`[B, 3, H, W]`) given `emb` (`[B, C]`: the
    /// timestep embedding plus the prompt embedding). Runs in `dtype` and
    /// returns float32.
    pub fn forward(&self, x: &Tensor, emb: &Tensor, dtype: DType) -> Result<Tensor> {
        let x = x.to_dtype(dtype)?;
        let emb = self.linear(&emb.to_dtype(dtype)?, "time_proj", dtype)?;
        let emb = candle_nn::ops::silu(&emb)?;

        let mut h = self.conv(&x, "conv_in", dtype)?;
        for i in 0..self.config.num_blocks {
            let prefix = format!("blocks.{}", i);
            let residual = h.clone();

            let t = self.norm(&h, &format!("{}.norm1", prefix), dtype)?;
            let t = self.conv(&candle_nn::ops::silu(&t)?, &format!("{}.conv1", prefix), dtype)?;
            let e = self.linear(&emb, &format!("{}.emb_proj", prefix), dtype)?;
            let t = t.broadcast_add(&e.unsqueeze(2)?.unsqueeze(3)?)?;
            let t = self.norm(&t, &format!("{}.norm2", prefix), dtype)?;
            let t = self.conv(&candle_nn::ops::silu(&t)?, &format!("{}.conv2", prefix), dtype)?;

            h = (residual + t)?;
        }
        let out = self.conv(&candle_nn::ops::silu(&h)?, "conv_out", dtype)?;
        Ok(out.to_dtype(DType::F32)?)
    }
}

/// Sinusoidal timestep embedding, `[B, dim]` float32.
pub fn timestep_embedding(timesteps: &[u32], dim: usize, device: &Device) -> Result<Tensor> {
    let half_dim = (dim / 2).max(1);
    let max_period = 10000f32;
    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| (-(i as f32) * (max_period.ln() / half_dim as f32)).exp())
        .collect();

    let mut data = Vec::with_capacity(timesteps.len() * dim);
    for &t in timesteps {
        let args = freqs.iter().map(|f| t as f32 * f);
        let mut row: Vec<f32> = args.clone().map(f32::cos).chain(args.map(f32::sin)).collect();
        row.resize(dim, 0.0);
        data.extend(row);
    }
    Ok(Tensor::from_vec(data, (timesteps.len(), dim), device)?)
}

fn uniform_var(shape: &[usize], fan_in: usize, device: &Device, rng: &mut StdRng) -> Result<Var> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count).map(|_| rng.gen_range(-bound..bound)).collect();
    Ok(Var::from_tensor(&Tensor::from_vec(data, shape, device)?)?)
}
