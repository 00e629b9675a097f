//! Hooks the trainer fires during `fit`

use anyhow::Result;

use super::module::TrainableModule;
use super::optim::AdamW;
use super::precision::GradScaler;
use crate::distributed::ProcessRole;

/// Position of the fit loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitProgress {
    /// Current epoch, zero based.
    pub epoch: usize,
    /// Completed optimizer steps.
    pub global_step: usize,
    /// Batches of the current epoch already consumed.
    pub batch_in_epoch: usize,
    /// Mean loss of the last optimizer step.
    pub last_loss: Option<f64>,
    /// Mean loss of the last finished epoch.
    pub epoch_loss: Option<f64>,
}

impl FitProgress {
    /// Value of a logged metric by name.
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "train_loss" => self.last_loss,
            "train_loss_epoch" => self.epoch_loss,
            "epoch" => Some(self.epoch as f64),
            "step" => Some(self.global_step as f64),
            _ => None,
        }
    }
}

/// Read-only view of the trainer state handed to callbacks.
pub struct CallbackContext<'a> {
    pub progress: &'a FitProgress,
    pub module: &'a dyn TrainableModule,
    pub optimizer: &'a AdamW,
    pub scaler: &'a GradScaler,
    pub role: ProcessRole,
}

pub trait Callback {
    fn name(&self) -> &str;

    fn on_fit_start(&mut self, _ctx: &CallbackContext<'_>) -> Result<()> {
        Ok(())
    }

    /// After every optimizer step.
    fn on_train_batch_end(&mut self, _ctx: &CallbackContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_train_epoch_end(&mut self, _ctx: &CallbackContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _ctx: &CallbackContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hook {
    FitStart,
    TrainBatchEnd,
    TrainEpochEnd,
    FitEnd,
}

pub(crate) fn fire(callbacks: &mut [Box<dyn Callback>], hook: Hook, ctx: &CallbackContext<'_>) -> Result<()> {
    for callback in callbacks.iter_mut() {
        log::trace!("{:?} -> {}", hook, callback.name());
        match hook {
            Hook::FitStart => callback.on_fit_start(ctx)?,
            Hook::TrainBatchEnd => callback.on_train_batch_end(ctx)?,
            Hook::TrainEpochEnd => callback.on_train_epoch_end(ctx)?,
            Hook::FitEnd => callback.on_fit_end(ctx)?,
        }
    }
    Ok(())
}

/// True when `count` is a positive multiple of `every`.
pub(crate) fn is_due(every: Option<usize>, count: usize) -> bool {
    match every {
        Some(n) if n > 0 => count > 0 && count % n == 0,
        _ => false,
    }
}
