//! The fit loop
//!
//! A `Trainer` is built once per process from explicit options, the
//! precision policy, telemetry sinks and callbacks. `tune` searches
//! hyperparameters, `fit` runs (or resumes) training.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor, Var};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

use super::callbacks::{fire, is_due, Callback, CallbackContext, FitProgress, Hook};
use super::checkpoint::CheckpointState;
use super::module::{shard_round_robin, Shard, TrainBatch, TrainableModule};
use super::optim::{clip_grad_norm, AdamW};
use super::options::{TrainerFlags, TrainerOptions};
use super::precision::{GradScaler, PrecisionPolicy};
use super::tuner::{lr_find, scale_batch_size, LrFindOptions, TuneResult};
use crate::distributed::ProcessRole;
use crate::loggers::{Metrics, TrainLogger};

const MAX_BATCH_SIZE_TRIALS: usize = 25;

pub struct Trainer {
    options: TrainerOptions,
    flags: TrainerFlags,
    policy: PrecisionPolicy,
    loggers: Vec<Box<dyn TrainLogger>>,
    callbacks: Vec<Box<dyn Callback>>,
    role: ProcessRole,
    device: Device,
    progress: FitProgress,
}

impl Trainer {
    pub fn new(
        options: TrainerOptions,
        flags: TrainerFlags,
        policy: PrecisionPolicy,
        loggers: Vec<Box<dyn TrainLogger>>,
        callbacks: Vec<Box<dyn Callback>>,
        role: ProcessRole,
    ) -> Result<Self> {
        options.validate()?;
        let device = options.accelerator.device()?;
        log::debug!(
            "Trainer on {:?}, precision {}, flags {:?}, {} loggers, {} callbacks",
            device,
            policy.precision(),
            flags,
            loggers.len(),
            callbacks.len()
        );
        Ok(Self {
            options,
            flags,
            policy,
            loggers,
            callbacks,
            role,
            device,
            progress: FitProgress::default(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    pub fn progress(&self) -> &FitProgress {
        &self.progress
    }

    /// Batch-size scaling, then the learning-rate range test, as enabled by
    /// the options. Tuned values are written back into the module.
    pub fn tune(&mut self, module: &mut dyn TrainableModule) -> Result<TuneResult> {
        let mut result = TuneResult::default();

        if self.options.auto_scale_batch_size {
            let batch_size = scale_batch_size(module, &self.policy, MAX_BATCH_SIZE_TRIALS)?;
            log::info!("Finished batch size finder, will continue with batch size {}", batch_size);
            result.batch_size = Some(batch_size);
        }

        if self.options.auto_lr_find {
            let finder = lr_find(module, &self.policy, &LrFindOptions::default())?;
            match finder.suggestion {
                Some(lr) => {
                    log::info!("Learning rate set to {:e}", lr);
                    module.set_learning_rate(lr);
                    result.learning_rate = Some(lr);
                }
                None => log::warn!(
                    "Learning rate finder could not suggest a value after {} steps, keeping {:e}",
                    finder.losses.len(),
                    module.learning_rate()
                ),
            }
        }

        Ok(result)
    }

    /// Train `module`, resuming from `ckpt_path` when given. Loggers are
    /// finalized whether or not training succeeds.
    pub fn fit(&mut self, module: &mut dyn TrainableModule, ckpt_path: Option<&Path>) -> Result<()> {
        let result = self.run_fit(module, ckpt_path);
        let status = if result.is_ok() { "success" } else { "failed" };
        if self.role.is_coordinator() {
            for logger in self.loggers.iter_mut() {
                if let Err(err) = logger.finalize(status) {
                    log::warn!("Failed to finalize {} logger: {}", logger.name(), err);
                }
            }
        }
        result
    }

    fn run_fit(&mut self, module: &mut dyn TrainableModule, ckpt_path: Option<&Path>) -> Result<()> {
        let mut optimizer = module.configure_optimizer();
        let mut scaler = GradScaler::new(self.policy.uses_loss_scaling());
        self.progress = FitProgress::default();

        if let Some(path) = ckpt_path {
            self.restore(module, &mut optimizer, &mut scaler, path)?;
        }

        if self.role.is_coordinator() {
            let hparams = module.hparams();
            for logger in self.loggers.iter_mut() {
                logger.log_hyperparams(&hparams)?;
            }
        }

        let params = module.named_parameters();
        let compute_dtype = self.policy.compute_dtype();
        let accumulate = self.options.accumulate_grad_batches;
        let max_epochs = self.options.max_epochs.unwrap_or(usize::MAX);

        log::info!(
            "Training {} parameter tensors on {:?}, {} samples, batch size {}",
            params.len(),
            self.device,
            module.num_train_samples(),
            module.batch_size()
        );

        self.notify(Hook::FitStart, module, &optimizer, &scaler)?;

        while self.progress.epoch < max_epochs && !self.max_steps_reached() {
            let epoch = self.progress.epoch;
            let batches = self.epoch_batches(module, epoch)?;
            if batches.is_empty() {
                bail!("No training batches for epoch {}", epoch);
            }

            let skip = self.progress.batch_in_epoch.min(batches.len());
            if skip > 0 {
                log::info!("Skipping {} batches already consumed in epoch {}", skip, epoch);
            }

            #[cfg(feature = "progress-bar")]
            let bar = self.epoch_bar(epoch, batches.len(), skip);

            let mut accumulated: BTreeMap<String, Tensor> = BTreeMap::new();
            let mut accumulated_loss = 0.0;
            let mut micro_batches = 0;
            let mut group_len = 0;
            let mut epoch_loss = 0.0;
            let mut epoch_steps = 0;
            let mut step_start = Instant::now();

            for (index, batch) in batches.iter().enumerate().skip(skip) {
                // The last group of an epoch may be shorter than `accumulate`
                if micro_batches == 0 {
                    group_len = accumulate.min(batches.len() - index);
                }
                let (loss, grads) = compute_gradients(module, batch, compute_dtype, &scaler, &params, group_len)?;
                add_gradients(&mut accumulated, grads)?;
                accumulated_loss += loss;
                micro_batches += 1;
                self.progress.batch_in_epoch = index + 1;

                #[cfg(feature = "progress-bar")]
                if let Some(bar) = &bar {
                    bar.inc(1);
                }

                if micro_batches < group_len {
                    continue;
                }

                let step_loss = accumulated_loss / micro_batches as f64;
                let mut grads = std::mem::take(&mut accumulated);
                accumulated_loss = 0.0;
                micro_batches = 0;

                let lr = optimizer.current_lr();
                let found_inf = scaler.unscale(&mut grads, &params)?;
                if found_inf {
                    log::warn!(
                        "Non-finite gradients at step {}, skipping optimizer step (loss scale {})",
                        self.progress.global_step,
                        scaler.scale()
                    );
                } else {
                    if let Some(max_norm) = self.options.gradient_clip_val {
                        clip_grad_norm(&mut grads, max_norm)?;
                    }
                    optimizer.step(&params, &grads)?;
                }
                scaler.update(found_inf);

                self.progress.global_step += 1;
                self.progress.last_loss = Some(step_loss);
                epoch_loss += step_loss;
                epoch_steps += 1;

                if is_due(Some(self.options.log_every_n_steps), self.progress.global_step) {
                    let mut metrics = Metrics::new();
                    metrics.insert("train_loss".to_string(), step_loss);
                    metrics.insert("lr".to_string(), lr);
                    metrics.insert("epoch".to_string(), epoch as f64);
                    if self.flags.benchmark {
                        metrics.insert(
                            "perf/step_time_ms".to_string(),
                            step_start.elapsed().as_secs_f64() * 1000.0,
                        );
                    }
                    self.log_metrics(&metrics)?;
                    log::debug!(
                        "Step {}: loss = {:.6}, lr = {:.2e}",
                        self.progress.global_step,
                        step_loss,
                        lr
                    );
                }

                #[cfg(feature = "progress-bar")]
                if let Some(bar) = &bar {
                    bar.set_message(format!("loss {:.4}", step_loss));
                }

                self.notify(Hook::TrainBatchEnd, module, &optimizer, &scaler)?;
                step_start = Instant::now();

                if self.max_steps_reached() {
                    log::info!("Reached max_steps = {}", self.progress.global_step);
                    break;
                }
            }

            #[cfg(feature = "progress-bar")]
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }

            if epoch_steps > 0 {
                let mean = epoch_loss / epoch_steps as f64;
                self.progress.epoch_loss = Some(mean);
                let mut metrics = Metrics::new();
                metrics.insert("train_loss_epoch".to_string(), mean);
                metrics.insert("epoch".to_string(), epoch as f64);
                self.log_metrics(&metrics)?;
                crate::rank_zero_info!(self.role, "Epoch {} finished, mean loss {:.6}", epoch, mean);
            }
            self.notify(Hook::TrainEpochEnd, module, &optimizer, &scaler)?;

            self.progress.epoch += 1;
            self.progress.batch_in_epoch = 0;
        }

        self.notify(Hook::FitEnd, module, &optimizer, &scaler)?;
        log::info!(
            "Training finished after {} epochs, {} steps",
            self.progress.epoch,
            self.progress.global_step
        );
        Ok(())
    }

    fn restore(
        &mut self,
        module: &mut dyn TrainableModule,
        optimizer: &mut AdamW,
        scaler: &mut GradScaler,
        path: &Path,
    ) -> Result<()> {
        log::info!("Restoring training state from {}", path.display());
        let mut state = CheckpointState::load(path, module.device())?;

        // Parameters come back in the dtype the module uses now
        for (name, var) in module.named_parameters() {
            if let Some(tensor) = state.params.get_mut(&name) {
                *tensor = tensor.to_dtype(var.dtype())?;
            }
        }
        module.load_parameters(&state.params)?;
        optimizer.load_state(state.optimizer_step, state.optimizer)?;
        optimizer.set_learning_rate(state.learning_rate);
        scaler.set_scale(state.loss_scale);

        self.progress = FitProgress {
            epoch: state.epoch,
            global_step: state.global_step,
            batch_in_epoch: state.batch_in_epoch,
            ..Default::default()
        };
        log::info!(
            "Resuming at epoch {}, step {} (batch {} of the epoch)",
            state.epoch,
            state.global_step,
            state.batch_in_epoch
        );
        Ok(())
    }

    fn epoch_batches(&self, module: &dyn TrainableModule, epoch: usize) -> Result<Vec<TrainBatch>> {
        let shard = self.role.is_distributed().then_some(Shard {
            rank: self.role.rank,
            world_size: self.role.world_size,
        });
        if self.flags.replace_sampler_ddp {
            let batches = module.train_batches(epoch, None)?;
            Ok(match shard {
                Some(shard) => shard_round_robin(batches, shard),
                None => batches,
            })
        } else {
            module.train_batches(epoch, shard)
        }
    }

    fn max_steps_reached(&self) -> bool {
        self.options
            .max_steps
            .map_or(false, |max| self.progress.global_step >= max)
    }

    fn log_metrics(&mut self, metrics: &Metrics) -> Result<()> {
        if !self.role.is_coordinator() {
            return Ok(());
        }
        for logger in self.loggers.iter_mut() {
            logger.log_metrics(metrics, self.progress.global_step)?;
        }
        Ok(())
    }

    fn notify(
        &mut self,
        hook: Hook,
        module: &dyn TrainableModule,
        optimizer: &AdamW,
        scaler: &GradScaler,
    ) -> Result<()> {
        let ctx = CallbackContext {
            progress: &self.progress,
            module,
            optimizer,
            scaler,
            role: self.role,
        };
        fire(&mut self.callbacks, hook, &ctx)
    }

    #[cfg(feature = "progress-bar")]
    fn epoch_bar(&self, epoch: usize, len: usize, done: usize) -> Option<ProgressBar> {
        if !self.options.enable_progress_bar || !self.role.is_coordinator() {
            return None;
        }
        let bar = ProgressBar::new(len as u64);
        let style = ProgressStyle::default_bar()
            .template("Epoch {prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_prefix(epoch.to_string());
        bar.set_position(done as u64);
        Some(bar)
    }
}

/// Forward and backward pass for one micro-batch. Returns the unscaled loss
/// and float32 gradients of `params` for a loss scaled by the scaler and
/// divided by `accumulate`.
pub(crate) fn compute_gradients(
    module: &mut dyn TrainableModule,
    batch: &TrainBatch,
    compute_dtype: DType,
    scaler: &GradScaler,
    params: &[(String, Var)],
    group_len: usize,
) -> Result<(f64, BTreeMap<String, Tensor>)> {
    let loss = module.training_step(batch, compute_dtype)?;
    let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;

    let scaled = scaler.scale_loss(&loss)?;
    let scaled = (scaled / group_len.max(1) as f64)?;
    let store = scaled.backward()?;

    let mut grads = BTreeMap::new();
    for (name, var) in params {
        if let Some(grad) = store.get(var.as_tensor()) {
            grads.insert(name.clone(), grad.to_dtype(DType::F32)?);
        }
    }
    Ok((value, grads))
}

fn add_gradients(total: &mut BTreeMap<String, Tensor>, grads: BTreeMap<String, Tensor>) -> Result<()> {
    for (name, grad) in grads {
        let sum = match total.remove(&name) {
            Some(existing) => (existing + grad)?,
            None => grad,
        };
        total.insert(name, sum);
    }
    Ok(())
}
