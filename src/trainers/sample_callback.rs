//! Writes sample images during training

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use std::fs;
use std::path::{Path, PathBuf};

use super::callbacks::{is_due, Callback, CallbackContext};
use crate::config::SamplingConfig;

pub struct SampleCallback {
    dirpath: PathBuf,
    options: SamplingConfig,
    last_sampled_step: Option<usize>,
}

impl SampleCallback {
    pub fn new(dirpath: impl Into<PathBuf>, options: SamplingConfig) -> Self {
        Self {
            dirpath: dirpath.into(),
            options,
            last_sampled_step: None,
        }
    }

    /// `samples/step_<6 digits>`
    pub fn step_dir(&self, step: usize) -> PathBuf {
        self.dirpath.join(format!("step_{:06}", step))
    }

    fn sample(&mut self, ctx: &CallbackContext<'_>) -> Result<()> {
        let step = ctx.progress.global_step;
        if !ctx.role.is_coordinator() || self.last_sampled_step == Some(step) {
            return Ok(());
        }
        self.last_sampled_step = Some(step);

        let samples = ctx.module.generate_samples(&self.options)?;
        if samples.is_empty() {
            log::debug!("Model produced no samples at step {}", step);
            return Ok(());
        }

        let dir = self.step_dir(step);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        for sample in &samples {
            save_image(&sample.image, dir.join(format!("{}.png", sample.name)))?;
        }
        log::info!("Saved {} samples to {}", samples.len(), dir.display());
        Ok(())
    }
}

impl Callback for SampleCallback {
    fn name(&self) -> &str {
        "SampleCallback"
    }

    fn on_train_batch_end(&mut self, ctx: &CallbackContext<'_>) -> Result<()> {
        if is_due(self.options.every_n_steps, ctx.progress.global_step) {
            self.sample(ctx)?;
        }
        Ok(())
    }

    fn on_train_epoch_end(&mut self, ctx: &CallbackContext<'_>) -> Result<()> {
        if is_due(self.options.every_n_epochs, ctx.progress.epoch + 1) {
            self.sample(ctx)?;
        }
        Ok(())
    }
}

/// Save a `[3, H, W]` tensor in [-1, 1] as an image, format from the extension.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let tensor = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.round()?;
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    if channel != 3 {
        bail!("Expected 3 channels (RGB), got {}", channel);
    }

    // CHW -> HWC for the image crate
    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let img = image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(width as u32, height as u32, data)
        .context("Failed to create image buffer")?;

    let path = path.as_ref();
    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => image::ImageFormat::Jpeg,
        _ => image::ImageFormat::Png,
    };
    img.save_with_format(path, format)
        .with_context(|| format!("Failed to save image: {}", path.display()))?;
    Ok(())
}
