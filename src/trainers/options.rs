//! Options recognized by the trainer and the checkpoint callback
//!
//! Both structs reject unknown keys: a misspelled option is a config error,
//! not a silently ignored setting.

use anyhow::{bail, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};

use super::precision::Precision;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerOptions {
    /// Stop after this many epochs.
    #[serde(default)]
    pub max_epochs: Option<usize>,
    /// Stop after this many optimizer steps.
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default)]
    pub precision: Precision,
    /// Micro-batches per optimizer step.
    #[serde(default = "default_one")]
    pub accumulate_grad_batches: usize,
    /// Clip the global gradient norm to this value.
    #[serde(default)]
    pub gradient_clip_val: Option<f64>,
    #[serde(default = "default_log_every")]
    pub log_every_n_steps: usize,
    /// Run a learning-rate range test during `tune`.
    #[serde(default)]
    pub auto_lr_find: bool,
    /// Grow the batch size during `tune` until a trial fails.
    #[serde(default)]
    pub auto_scale_batch_size: bool,
    #[serde(default)]
    pub accelerator: Accelerator,
    #[serde(default = "default_true")]
    pub enable_progress_bar: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl Accelerator {
    pub fn device(&self) -> Result<Device> {
        Ok(match self {
            Accelerator::Cpu => Device::Cpu,
            Accelerator::Auto => Device::cuda_if_available(0)?,
            Accelerator::Gpu => {
                let device = Device::cuda_if_available(0)?;
                if !device.is_cuda() {
                    bail!("accelerator 'gpu' requested but no CUDA device is available");
                }
                device
            }
        })
    }
}

impl TrainerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_epochs.is_none() && self.max_steps.is_none() {
            bail!("trainer.max_epochs or trainer.max_steps must be set");
        }
        if self.accumulate_grad_batches == 0 {
            bail!("trainer.accumulate_grad_batches must be at least 1");
        }
        Ok(())
    }
}

/// Trainer switches derived from the data pipeline rather than set by users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainerFlags {
    /// Input shapes are fixed; per-step timings are reported.
    pub benchmark: bool,
    /// The trainer shards batches across ranks itself.
    pub replace_sampler_ddp: bool,
}

impl TrainerFlags {
    /// Aspect-ratio bucketing needs its own sampler and variable shapes.
    pub fn for_bucketing(bucketing_enabled: bool) -> Self {
        Self {
            benchmark: !bucketing_enabled,
            replace_sampler_ddp: !bucketing_enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointOptions {
    /// File name template without extension. `{epoch}`, `{step}` and
    /// `{train_loss}` are substituted.
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub every_n_train_steps: Option<usize>,
    #[serde(default)]
    pub every_n_epochs: Option<usize>,
    /// Checkpoints to keep, -1 keeps all.
    #[serde(default = "default_top_k")]
    pub save_top_k: i64,
    /// Metric ranking checkpoints. Without it the newest are kept.
    #[serde(default)]
    pub monitor: Option<String>,
    #[serde(default)]
    pub mode: CheckpointMode,
    /// Also maintain `last.ckpt`.
    #[serde(default)]
    pub save_last: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    #[default]
    Min,
    Max,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            filename: None,
            every_n_train_steps: None,
            every_n_epochs: Some(1),
            save_top_k: default_top_k(),
            monitor: None,
            mode: CheckpointMode::Min,
            save_last: false,
        }
    }
}

fn default_one() -> usize {
    1
}

fn default_log_every() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_top_k() -> i64 {
    -1
}
