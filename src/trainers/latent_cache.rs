//! Pre-encoded dataset cache
//!
//! Layout: `pixels.<i>` tensors `[3, H, W]`, a `conditions` U32 tensor and an
//! `is_class` U8 tensor with one entry per sample, and the prompt table as a
//! JSON array in the `prompts` metadata entry.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

use super::concept_data_loader::{ConceptDataset, ImageSample};
use super::safetensors_io::{read_safetensors, write_safetensors};

const PROMPTS_KEY: &str = "prompts";

/// Write `dataset` as a cache file.
pub fn save_cache(dataset: &ConceptDataset, path: &Path) -> Result<()> {
    let samples: Vec<&ImageSample> = dataset.instance().iter().chain(dataset.class()).collect();
    let device = Device::Cpu;

    let mut tensors = Vec::with_capacity(samples.len() + 2);
    for (index, sample) in samples.iter().enumerate() {
        tensors.push((format!("pixels.{}", index), sample.pixels.to_dtype(DType::F32)?));
    }
    let conditions: Vec<u32> = samples.iter().map(|s| s.condition as u32).collect();
    let is_class: Vec<u8> = samples.iter().map(|s| s.is_class as u8).collect();
    let count = samples.len();
    tensors.push(("conditions".to_string(), Tensor::from_vec(conditions, count, &device)?));
    tensors.push(("is_class".to_string(), Tensor::from_vec(is_class, count, &device)?));

    let mut metadata = HashMap::new();
    metadata.insert(PROMPTS_KEY.to_string(), serde_json::to_string(dataset.prompts())?);

    write_safetensors(path, &tensors, metadata)?;
    log::info!("Cached {} samples to {}", samples.len(), path.display());
    Ok(())
}

/// Read a cache file. Class samples are dropped unless `load_class`.
pub fn load_cache(path: &Path, load_class: bool) -> Result<ConceptDataset> {
    let (tensors, metadata) = read_safetensors(path, &Device::Cpu)
        .with_context(|| format!("Failed to load cache: {}", path.display()))?;

    let prompts: Vec<String> = match metadata.get(PROMPTS_KEY) {
        Some(json) => serde_json::from_str(json).context("Invalid prompt table in cache")?,
        None => bail!("Cache {} has no prompt table", path.display()),
    };
    let conditions = tensors
        .get("conditions")
        .context("Cache is missing the conditions tensor")?
        .to_vec1::<u32>()?;
    let is_class = tensors
        .get("is_class")
        .context("Cache is missing the is_class tensor")?
        .to_vec1::<u8>()?;
    if conditions.len() != is_class.len() {
        bail!(
            "Cache has {} conditions but {} class flags",
            conditions.len(),
            is_class.len()
        );
    }

    let mut instance = Vec::new();
    let mut class = Vec::new();
    for (index, (&condition, &flag)) in conditions.iter().zip(&is_class).enumerate() {
        let condition = condition as usize;
        if condition >= prompts.len() {
            bail!("Cache sample {} uses condition {} without a prompt", index, condition);
        }
        let pixels = tensors
            .get(&format!("pixels.{}", index))
            .with_context(|| format!("Cache is missing pixels.{}", index))?
            .to_dtype(DType::F32)?;
        if pixels.rank() != 3 || pixels.dims()[0] != 3 {
            bail!("Cache sample {} has shape {:?}, expected [3, H, W]", index, pixels.dims());
        }

        let sample = ImageSample {
            pixels,
            condition,
            is_class: flag != 0,
        };
        match (sample.is_class, load_class) {
            (false, _) => instance.push(sample),
            (true, true) => class.push(sample),
            (true, false) => {}
        }
    }

    if instance.is_empty() {
        bail!("Cache {} holds no instance samples", path.display());
    }
    log::info!(
        "Loaded {} instance and {} class samples from cache {}",
        instance.len(),
        class.len(),
        path.display()
    );
    Ok(ConceptDataset::new(prompts, instance, class))
}
