//! Fine-tunable diffusion model with its dataset
//!
//! Owns the denoiser (the `unet` core sub-network), a per-prompt conditioning
//! embedding, the noise schedule and the decoded training images.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::denoiser::{timestep_embedding, Denoiser, DenoiserConfig};
use crate::config::{Config, OptimizerConfig, SamplingConfig};
use crate::trainers::aspect_buckets::{bucket_batches, shuffled_batches, AspectBuckets};
use crate::trainers::concept_data_loader::{ConceptDataset, ImageSample};
use crate::trainers::ddpm_scheduler::{compute_snr_loss_weights, DDPMScheduler};
use crate::trainers::latent_cache::load_cache;
use crate::trainers::optim::AdamW;
use crate::trainers::module::{shard_round_robin, GeneratedSample, Shard, TrainBatch, TrainableModule};
use crate::trainers::safetensors_io::read_safetensors;

/// Name of the core sub-network, also the prefix of its parameter names.
pub const CORE_NAME: &str = "unet";
const COND_EMBEDDING: &str = "cond_embedding.weight";

pub struct StableDiffusionModel {
    device: Device,
    pub unet: Denoiser,
    cond_embedding: Var,
    scheduler: DDPMScheduler,
    dataset: ConceptDataset,
    bucketing: bool,
    learning_rate: f64,
    optimizer: OptimizerConfig,
    batch_size: usize,
    prior_loss_weight: Option<f64>,
    snr_gamma: Option<f32>,
    resolution: usize,
    seed: u64,
    noise_rng: StdRng,
    hparams: serde_json::Value,
}

impl StableDiffusionModel {
    /// Load the dataset, build and seed the networks, and load pretrained
    /// weights when configured.
    pub fn from_config(config: &Config, device: &Device, seed: u64) -> Result<Self> {
        let load_class = config.prior_preservation.enabled;
        let buckets = if config.aspect_ratio_bucket.enabled {
            Some(AspectBuckets::new(&config.aspect_ratio_bucket, config.data.resolution)?)
        } else {
            None
        };

        let dataset = match &config.data.cache {
            Some(cache) => load_cache(cache, load_class)?,
            None => ConceptDataset::from_concepts(&config.data.concepts, &config.data, buckets.as_ref(), load_class)?,
        };
        if dataset.instance().is_empty() {
            bail!("Training set is empty");
        }

        let mut init_rng = StdRng::seed_from_u64(seed);
        let denoiser_config = DenoiserConfig {
            base_channels: config.model.base_channels,
            num_blocks: config.model.num_blocks,
        };
        let mut unet = Denoiser::new(denoiser_config, device, &mut init_rng)?;

        let num_prompts = dataset.prompts().len().max(1);
        let emb: Vec<f32> = (0..num_prompts * denoiser_config.base_channels)
            .map(|_| StandardNormal.sample(&mut init_rng))
            .map(|v: f32| v * 0.02)
            .collect();
        let cond_embedding = Var::from_tensor(&Tensor::from_vec(
            emb,
            (num_prompts, denoiser_config.base_channels),
            device,
        )?)?;

        if let Some(pretrained) = &config.model.pretrained {
            load_pretrained(&mut unet, pretrained, device)?;
        }

        let scheduler = DDPMScheduler::new(
            config.model.num_train_timesteps,
            config.model.beta_start,
            config.model.beta_end,
            &config.model.beta_schedule,
            device,
        )?;

        let hparams = serde_json::json!({
            "model": config.model,
            "optimizer": config.optimizer,
            "data": {
                "resolution": config.data.resolution,
                "batch_size": config.data.batch_size,
                "num_instance_images": dataset.instance().len(),
                "num_class_images": dataset.class().len(),
            },
            "prior_preservation": config.prior_preservation,
            "aspect_ratio_bucket": config.aspect_ratio_bucket,
            "seed": seed,
        });

        Ok(Self {
            device: device.clone(),
            unet,
            cond_embedding,
            scheduler,
            dataset,
            bucketing: buckets.is_some(),
            learning_rate: config.optimizer.learning_rate,
            optimizer: config.optimizer.clone(),
            batch_size: config.data.batch_size.max(1),
            prior_loss_weight: load_class.then_some(config.prior_preservation.prior_loss_weight),
            snr_gamma: config.model.snr_gamma,
            resolution: config.data.resolution,
            seed,
            noise_rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            hparams,
        })
    }

    fn randn(&self, shape: (usize, usize, usize, usize), rng: &mut StdRng) -> Result<Tensor> {
        let count = shape.0 * shape.1 * shape.2 * shape.3;
        let data: Vec<f32> = (0..count).map(|_| StandardNormal.sample(rng)).collect();
        Ok(Tensor::from_vec(data, shape, &self.device)?)
    }

    /// Denoiser conditioning for `timesteps` and prompt `conditions`, `[B, C]`.
    fn conditioning(&self, timesteps: &[u32], conditions: &[u32]) -> Result<Tensor> {
        let dim = self.unet.config().base_channels;
        let temb = timestep_embedding(timesteps, dim, &self.device)?;
        let ids = Tensor::new(conditions, &self.device)?;
        let cemb = self.cond_embedding.as_tensor().index_select(&ids, 0)?;
        Ok((temb + cemb)?)
    }

    /// Summed per-sample noise prediction loss over same-sized groups.
    fn denoising_loss(&self, samples: &[&ImageSample], dtype: DType, rng: &mut StdRng) -> Result<Tensor> {
        let mut groups: BTreeMap<(usize, usize), Vec<&ImageSample>> = BTreeMap::new();
        for &sample in samples {
            groups.entry(sample.size()).or_default().push(sample);
        }

        let mut total: Option<Tensor> = None;
        for ((width, height), group) in groups {
            let n = group.len();
            let pixels: Vec<Tensor> = group.iter().map(|s| s.pixels.clone()).collect();
            let clean = Tensor::stack(&pixels, 0)?.to_device(&self.device)?;
            let noise = self.randn((n, 3, height, width), rng)?;
            let timesteps = self.scheduler.sample_timesteps(n, rng);
            let t = Tensor::new(timesteps.as_slice(), &self.device)?;
            let noisy = self.scheduler.add_noise(&clean, &noise, &t)?;

            let conditions: Vec<u32> = group.iter().map(|s| s.condition as u32).collect();
            let emb = self.conditioning(&timesteps, &conditions)?;
            let pred = self.unet.forward(&noisy, &emb, dtype)?;

            let per_sample = (pred - &noise)?.sqr()?.flatten_from(1)?.mean(1)?;
            let per_sample = match self.snr_gamma {
                Some(gamma) => {
                    let weights = compute_snr_loss_weights(&self.scheduler.snr(&timesteps), gamma);
                    (per_sample * Tensor::from_vec(weights, n, &self.device)?)?
                }
                None => per_sample,
            };
            let sum = per_sample.sum_all()?;
            total = Some(match total {
                Some(acc) => (acc + sum)?,
                None => sum,
            });
        }

        let total = total.ok_or_else(|| anyhow!("Empty batch"))?;
        Ok((total / samples.len() as f64)?)
    }

    /// Generate one image with deterministic DDIM from seeded noise.
    fn sample_image(
        &self,
        condition: usize,
        width: usize,
        height: usize,
        steps: usize,
        seed: u64,
    ) -> Result<Tensor> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..3 * width * height).map(|_| StandardNormal.sample(&mut rng)).collect();
        let mut latents = Tensor::from_vec(data, (1, 3, height, width), &self.device)?;

        let timesteps = self.scheduler.inference_timesteps(steps);
        for (i, &t) in timesteps.iter().enumerate() {
            let emb = self.conditioning(&[t as u32], &[condition as u32])?;
            let noise_pred = self.unet.forward(&latents, &emb, DType::F32)?;
            latents = self
                .scheduler
                .ddim_step(&noise_pred, t, timesteps.get(i + 1).copied(), &latents)?;
        }
        Ok(latents.squeeze(0)?.clamp(-1f32, 1f32)?)
    }
}

impl TrainableModule for StableDiffusionModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params: Vec<(String, Var)> = self
            .unet
            .params()
            .iter()
            .map(|(name, var)| (format!("{}.{}", CORE_NAME, name), var.clone()))
            .collect();
        params.push((COND_EMBEDDING.to_string(), self.cond_embedding.clone()));
        params
    }

    fn load_parameters(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let expected = self.unet.params().len();
        let loaded = self.unet.load(tensors, &format!("{}.", CORE_NAME))?;
        if loaded != expected {
            bail!("Checkpoint has {} of {} {} weights", loaded, expected, CORE_NAME);
        }
        let emb = tensors
            .get(COND_EMBEDDING)
            .with_context(|| format!("Checkpoint is missing {}", COND_EMBEDDING))?;
        if emb.dims() != self.cond_embedding.dims() {
            bail!(
                "Checkpoint {} has shape {:?}, expected {:?}",
                COND_EMBEDDING,
                emb.dims(),
                self.cond_embedding.dims()
            );
        }
        self.cond_embedding
            .set(&emb.to_dtype(self.cond_embedding.dtype())?.to_device(&self.device)?)?;
        Ok(())
    }

    fn cast_core(&mut self, dtype: DType) -> Result<()> {
        self.unet.cast(dtype)
    }

    fn configure_optimizer(&self) -> AdamW {
        AdamW::new(self.learning_rate, &self.optimizer)
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    fn num_train_samples(&self) -> usize {
        self.dataset.instance().len()
    }

    fn train_batches(&self, epoch: usize, shard: Option<Shard>) -> Result<Vec<TrainBatch>> {
        let groups = if self.bucketing {
            bucket_batches(&self.dataset.instance_sizes(), self.batch_size, self.seed, epoch, shard)
        } else {
            let batches = shuffled_batches(self.num_train_samples(), self.batch_size, self.seed, epoch);
            match shard {
                Some(shard) => shard_round_robin(batches, shard),
                None => batches,
            }
        };

        Ok(groups
            .into_iter()
            .map(|instance| {
                let class = match self.prior_loss_weight {
                    Some(_) => instance
                        .iter()
                        .filter_map(|&i| self.dataset.paired_class(i, epoch))
                        .collect(),
                    None => Vec::new(),
                };
                TrainBatch { instance, class }
            })
            .collect())
    }

    fn training_step(&mut self, batch: &TrainBatch, compute_dtype: DType) -> Result<Tensor> {
        if batch.is_empty() {
            bail!("Empty training batch");
        }
        let mut rng = self.noise_rng.clone();
        let instance: Vec<&ImageSample> = batch
            .instance
            .iter()
            .map(|&i| self.dataset.instance().get(i).ok_or_else(|| anyhow!("No instance sample {}", i)))
            .collect::<Result<_>>()?;
        let mut loss = self.denoising_loss(&instance, compute_dtype, &mut rng)?;

        if let Some(weight) = self.prior_loss_weight {
            if !batch.class.is_empty() {
                let class: Vec<&ImageSample> = batch
                    .class
                    .iter()
                    .map(|&i| self.dataset.class().get(i).ok_or_else(|| anyhow!("No class sample {}", i)))
                    .collect::<Result<_>>()?;
                let prior_loss = self.denoising_loss(&class, compute_dtype, &mut rng)?;
                loss = (loss + (prior_loss * weight)?)?;
            }
        }
        self.noise_rng = rng;
        Ok(loss)
    }

    fn hparams(&self) -> serde_json::Value {
        self.hparams.clone()
    }

    fn generate_samples(&self, options: &SamplingConfig) -> Result<Vec<GeneratedSample>> {
        let width = options.width.unwrap_or(self.resolution);
        let height = options.height.unwrap_or(self.resolution);

        let mut samples = Vec::new();
        for condition in self.dataset.instance_conditions() {
            let slug = prompt_slug(self.dataset.prompt(condition));
            for k in 0..options.num_samples {
                let seed = options.seed.wrapping_add(k as u64);
                let image = self.sample_image(condition, width, height, options.num_inference_steps, seed)?;
                samples.push(GeneratedSample {
                    name: format!("{}_{}", slug, k),
                    image,
                });
            }
        }
        Ok(samples)
    }
}

fn load_pretrained(unet: &mut Denoiser, path: &Path, device: &Device) -> Result<()> {
    let (tensors, _) = read_safetensors(path, device)
        .with_context(|| format!("Failed to load pretrained weights: {}", path.display()))?;

    let expected = unet.params().len();
    let prefixed = unet.load(&tensors, &format!("{}.", CORE_NAME))?;
    let loaded = if prefixed > 0 { prefixed } else { unet.load(&tensors, "")? };
    if loaded == 0 {
        bail!("No {} weights found in {}", CORE_NAME, path.display());
    }
    if loaded < expected {
        log::warn!(
            "Pretrained weights cover {} of {} {} tensors, the rest keep their initialization",
            loaded,
            expected,
            CORE_NAME
        );
    }
    log::info!("Loaded pretrained {} from {}", CORE_NAME, path.display());
    Ok(())
}

/// File-name-safe form of a prompt.
pub fn prompt_slug(prompt: &str) -> String {
    let slug: String = prompt
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let slug = slug
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    let slug: String = slug.chars().take(48).collect();
    if slug.is_empty() {
        "sample".to_string()
    } else {
        slug
    }
}
