//! Training checkpoints
//!
//! One safetensors file per checkpoint: `model.<param>` weights,
//! `optimizer.m.<param>` / `optimizer.v.<param>` AdamW moments and the loop
//! position as string metadata.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::callbacks::{is_due, Callback, CallbackContext};
use super::options::{CheckpointMode, CheckpointOptions};
use super::safetensors_io::{read_safetensors, write_safetensors};

pub const CHECKPOINT_FORMAT: &str = "sd-finetune-ckpt-v1";
pub const CHECKPOINT_EXTENSION: &str = "ckpt";
pub const LAST_CHECKPOINT: &str = "last.ckpt";
const DEFAULT_FILENAME: &str = "epoch={epoch}-step={step}";

const MODEL_PREFIX: &str = "model.";
const MOMENT_M_PREFIX: &str = "optimizer.m.";
const MOMENT_V_PREFIX: &str = "optimizer.v.";

/// Everything needed to continue a fit.
#[derive(Debug, Clone)]
pub struct CheckpointState {
    /// Epoch to continue in.
    pub epoch: usize,
    pub global_step: usize,
    /// Batches of `epoch` already consumed.
    pub batch_in_epoch: usize,
    pub optimizer_step: usize,
    pub learning_rate: f64,
    pub loss_scale: f64,
    pub params: HashMap<String, Tensor>,
    pub optimizer: HashMap<String, (Tensor, Tensor)>,
}

impl CheckpointState {
    /// Snapshot the trainer state. After an epoch ends the checkpoint resumes
    /// at the start of the next one.
    pub fn capture(ctx: &CallbackContext<'_>, epoch_finished: bool) -> Self {
        let progress = ctx.progress;
        let (epoch, batch_in_epoch) = if epoch_finished {
            (progress.epoch + 1, 0)
        } else {
            (progress.epoch, progress.batch_in_epoch)
        };

        Self {
            epoch,
            global_step: progress.global_step,
            batch_in_epoch,
            optimizer_step: ctx.optimizer.step_count(),
            learning_rate: ctx.optimizer.learning_rate(),
            loss_scale: ctx.scaler.scale(),
            params: ctx
                .module
                .named_parameters()
                .into_iter()
                .map(|(name, var)| (name, var.as_tensor().clone()))
                .collect(),
            optimizer: ctx.optimizer.state_tensors(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = Vec::with_capacity(self.params.len() + 2 * self.optimizer.len());
        for (name, tensor) in &self.params {
            tensors.push((format!("{}{}", MODEL_PREFIX, name), tensor.clone()));
        }
        for (name, (m, v)) in &self.optimizer {
            tensors.push((format!("{}{}", MOMENT_M_PREFIX, name), m.clone()));
            tensors.push((format!("{}{}", MOMENT_V_PREFIX, name), v.clone()));
        }
        tensors.sort_by(|a, b| a.0.cmp(&b.0));

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), CHECKPOINT_FORMAT.to_string());
        metadata.insert("epoch".to_string(), self.epoch.to_string());
        metadata.insert("global_step".to_string(), self.global_step.to_string());
        metadata.insert("batch_in_epoch".to_string(), self.batch_in_epoch.to_string());
        metadata.insert("optimizer_step".to_string(), self.optimizer_step.to_string());
        metadata.insert("learning_rate".to_string(), self.learning_rate.to_string());
        metadata.insert("loss_scale".to_string(), self.loss_scale.to_string());

        write_safetensors(path, &tensors, metadata)
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let (tensors, metadata) = read_safetensors(path, device)
            .with_context(|| format!("Failed to load checkpoint: {}", path.display()))?;

        match metadata.get("format").map(String::as_str) {
            Some(CHECKPOINT_FORMAT) => {}
            other => bail!(
                "{} is not a training checkpoint (format {:?})",
                path.display(),
                other
            ),
        }

        let mut params = HashMap::new();
        let mut moments_m = HashMap::new();
        let mut moments_v = HashMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
                params.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(MOMENT_M_PREFIX) {
                moments_m.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(MOMENT_V_PREFIX) {
                moments_v.insert(name.to_string(), tensor);
            } else {
                log::debug!("Ignoring unknown checkpoint entry {}", key);
            }
        }

        let mut optimizer = HashMap::new();
        for (name, m) in moments_m {
            let v = moments_v
                .remove(&name)
                .with_context(|| format!("Checkpoint has a first moment but no second moment for {}", name))?;
            optimizer.insert(name, (m, v));
        }

        Ok(Self {
            epoch: parse_meta(&metadata, "epoch")?,
            global_step: parse_meta(&metadata, "global_step")?,
            batch_in_epoch: parse_meta(&metadata, "batch_in_epoch")?,
            optimizer_step: parse_meta(&metadata, "optimizer_step")?,
            learning_rate: parse_meta(&metadata, "learning_rate")?,
            loss_scale: parse_meta(&metadata, "loss_scale")?,
            params,
            optimizer,
        })
    }
}

fn parse_meta<T: std::str::FromStr>(metadata: &HashMap<String, String>, key: &str) -> Result<T> {
    let raw = metadata
        .get(key)
        .with_context(|| format!("Checkpoint metadata is missing {}", key))?;
    raw.parse()
        .map_err(|_| anyhow::anyhow!("Invalid checkpoint metadata {} = {:?}", key, raw))
}

/// Saves checkpoints into a directory and prunes them to `save_top_k`.
pub struct ModelCheckpoint {
    dirpath: PathBuf,
    options: CheckpointOptions,
    /// Kept checkpoints with their monitored score.
    kept: Vec<(PathBuf, Option<f64>)>,
    last_saved_step: Option<usize>,
    warned_monitor: bool,
}

impl ModelCheckpoint {
    pub fn new(dirpath: impl Into<PathBuf>, options: CheckpointOptions) -> Self {
        Self {
            dirpath: dirpath.into(),
            options,
            kept: Vec::new(),
            last_saved_step: None,
            warned_monitor: false,
        }
    }

    /// Paths of the checkpoints currently kept, oldest first.
    pub fn kept(&self) -> Vec<&Path> {
        self.kept.iter().map(|(p, _)| p.as_path()).collect()
    }

    /// File name for the current progress, with the extension.
    pub fn format_filename(&self, epoch: usize, step: usize, train_loss: Option<f64>) -> String {
        let template = self.options.filename.as_deref().unwrap_or(DEFAULT_FILENAME);
        let loss = train_loss.map(|l| format!("{:.4}", l)).unwrap_or_else(|| "nan".to_string());
        let stem = template
            .replace("{epoch}", &epoch.to_string())
            .replace("{step}", &step.to_string())
            .replace("{train_loss}", &loss);
        format!("{}.{}", stem, CHECKPOINT_EXTENSION)
    }

    fn score(&mut self, ctx: &CallbackContext<'_>) -> Option<f64> {
        let monitor = self.options.monitor.as_deref()?;
        let value = ctx.progress.metric(monitor);
        if value.is_none() && !self.warned_monitor {
            log::warn!("Checkpoint monitor {:?} is not a logged metric, keeping the newest checkpoints", monitor);
            self.warned_monitor = true;
        }
        value
    }

    /// Whether `a` ranks better than `b`.
    fn better(&self, a: Option<f64>, b: Option<f64>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => match self.options.mode {
                CheckpointMode::Min => a < b,
                CheckpointMode::Max => a > b,
            },
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn save(&mut self, ctx: &CallbackContext<'_>, epoch_finished: bool) -> Result<()> {
        let progress = ctx.progress;
        if !ctx.role.is_coordinator() || self.last_saved_step == Some(progress.global_step) {
            return Ok(());
        }
        self.last_saved_step = Some(progress.global_step);
        fs::create_dir_all(&self.dirpath)
            .with_context(|| format!("Failed to create checkpoint directory: {}", self.dirpath.display()))?;

        let state = CheckpointState::capture(ctx, epoch_finished);
        let score = self.score(ctx);

        if self.options.save_top_k != 0 {
            let path = self
                .dirpath
                .join(self.format_filename(progress.epoch, progress.global_step, progress.last_loss));
            let top_k = self.options.save_top_k;
            let ranked = self.options.monitor.is_some() && score.is_some();

            // A full ranked list only admits a better score
            let full = top_k > 0 && self.kept.len() as i64 >= top_k;
            let admit = !full
                || !ranked
                || self.kept.iter().any(|(_, kept)| self.better(score, *kept));

            if admit {
                state.save(&path)?;
                log::info!("Saved checkpoint {}", path.display());
                self.kept.retain(|(p, _)| p != &path);
                self.kept.push((path, score));
                self.prune()?;
            }
        }

        if self.options.save_last {
            let last = self.dirpath.join(LAST_CHECKPOINT);
            state.save(&last)?;
            log::debug!("Updated {}", last.display());
        }
        Ok(())
    }

    /// Drop checkpoints beyond `save_top_k`: the worst when ranked, else the oldest.
    fn prune(&mut self) -> Result<()> {
        let Ok(limit) = usize::try_from(self.options.save_top_k) else {
            return Ok(());
        };
        while self.kept.len() > limit {
            let ranked = self.options.monitor.is_some() && self.kept.iter().all(|(_, s)| s.is_some());
            let victim = if ranked {
                let mut worst = 0;
                for i in 1..self.kept.len() {
                    if self.better(self.kept[worst].1, self.kept[i].1) {
                        worst = i;
                    }
                }
                worst
            } else {
                0
            };
            let (path, _) = self.kept.remove(victim);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove checkpoint {}", path.display()))?;
            }
            log::debug!("Removed checkpoint {}", path.display());
        }
        Ok(())
    }
}

impl Callback for ModelCheckpoint {
    fn name(&self) -> &str {
        "ModelCheckpoint"
    }

    fn on_train_batch_end(&mut self, ctx: &CallbackContext<'_>) -> Result<()> {
        if is_due(self.options.every_n_train_steps, ctx.progress.global_step) {
            self.save(ctx, false)?;
        }
        Ok(())
    }

    fn on_train_epoch_end(&mut self, ctx: &CallbackContext<'_>) -> Result<()> {
        if is_due(self.options.every_n_epochs, ctx.progress.epoch + 1) {
            self.save(ctx, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::distributed::ProcessRole;
    use crate::trainers::callbacks::FitProgress;
    use crate::trainers::module::{Shard, TrainBatch, TrainableModule};
    use crate::trainers::optim::AdamW;
    use crate::trainers::precision::GradScaler;
    use candle_core::{DType, Var};

    fn optimizer_config() -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: 0.01,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            warmup_steps: 0,
        }
    }

    struct Weights {
        device: Device,
        w: Var,
    }

    impl TrainableModule for Weights {
        fn device(&self) -> &Device {
            &self.device
        }
        fn named_parameters(&self) -> Vec<(String, Var)> {
            vec![("w".to_string(), self.w.clone())]
        }
        fn load_parameters(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
            self.w.set(&tensors["w"])?;
            Ok(())
        }
        fn cast_core(&mut self, _dtype: DType) -> Result<()> {
            Ok(())
        }
        fn configure_optimizer(&self) -> AdamW {
            AdamW::new(0.01, &optimizer_config())
        }
        fn learning_rate(&self) -> f64 {
            0.01
        }
        fn set_learning_rate(&mut self, _lr: f64) {}
        fn batch_size(&self) -> usize {
            1
        }
        fn set_batch_size(&mut self, _batch_size: usize) {}
        fn num_train_samples(&self) -> usize {
            1
        }
        fn train_batches(&self, _epoch: usize, _shard: Option<Shard>) -> Result<Vec<TrainBatch>> {
            Ok(Vec::new())
        }
        fn training_step(&mut self, _batch: &TrainBatch, _dtype: DType) -> Result<Tensor> {
            Ok(self.w.as_tensor().sum_all()?)
        }
    }

    fn weights() -> Weights {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[1f32, 2.0], &device).unwrap()).unwrap();
        Weights { device, w }
    }

    #[test]
    fn test_state_survives_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let module = weights();
        let mut optimizer = module.configure_optimizer();
        let mut grads = std::collections::BTreeMap::new();
        grads.insert("w".to_string(), Tensor::new(&[1f32, 1.0], &module.device)?);
        optimizer.step(&module.named_parameters(), &grads)?;

        let progress = FitProgress { epoch: 1, global_step: 5, batch_in_epoch: 2, ..Default::default() };
        let scaler = GradScaler::new(true);
        let ctx = CallbackContext {
            progress: &progress,
            module: &module,
            optimizer: &optimizer,
            scaler: &scaler,
            role: ProcessRole::single(),
        };

        let path = dir.path().join("a.ckpt");
        CheckpointState::capture(&ctx, false).save(&path)?;
        let loaded = CheckpointState::load(&path, &Device::Cpu)?;
        assert_eq!(loaded.epoch, 1);
        assert_eq!(loaded.global_step, 5);
        assert_eq!(loaded.batch_in_epoch, 2);
        assert_eq!(loaded.optimizer_step, 1);
        assert_eq!(loaded.loss_scale, 65536.0);
        assert!(loaded.params.contains_key("w"));
        assert!(loaded.optimizer.contains_key("w"));

        let at_epoch_end = CheckpointState::capture(&ctx, true);
        assert_eq!((at_epoch_end.epoch, at_epoch_end.batch_in_epoch), (2, 0));
        Ok(())
    }

    #[test]
    fn test_load_rejects_foreign_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.safetensors");
        let tensors = vec![("w".to_string(), Tensor::new(&[1f32], &Device::Cpu)?)];
        write_safetensors(&path, &tensors, HashMap::new())?;
        assert!(CheckpointState::load(&path, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_filename_template() {
        let mut options = CheckpointOptions::default();
        let callback = ModelCheckpoint::new("/tmp", options.clone());
        assert_eq!(callback.format_filename(0, 10, None), "epoch=0-step=10.ckpt");

        options.filename = Some("{step}-{train_loss}".to_string());
        let callback = ModelCheckpoint::new("/tmp", options);
        assert_eq!(callback.format_filename(0, 3, Some(0.25)), "3-0.2500.ckpt");
    }

    #[test]
    fn test_top_k_keeps_best_scores() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let module = weights();
        let optimizer = module.configure_optimizer();
        let scaler = GradScaler::new(false);
        let options = CheckpointOptions {
            every_n_train_steps: Some(1),
            every_n_epochs: None,
            save_top_k: 2,
            monitor: Some("train_loss".to_string()),
            save_last: true,
            ..Default::default()
        };
        let mut callback = ModelCheckpoint::new(dir.path(), options);

        for (step, loss) in [(1, 0.5), (2, 0.9), (3, 0.1), (4, 0.7)] {
            let progress = FitProgress { global_step: step, last_loss: Some(loss), ..Default::default() };
            let ctx = CallbackContext {
                progress: &progress,
                module: &module,
                optimizer: &optimizer,
                scaler: &scaler,
                role: ProcessRole::single(),
            };
            callback.on_train_batch_end(&ctx)?;
        }

        let mut kept: Vec<String> = callback
            .kept()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        kept.sort();
        assert_eq!(kept, vec!["epoch=0-step=1.ckpt", "epoch=0-step=3.ckpt"]);
        assert!(!dir.path().join("epoch=0-step=2.ckpt").exists());
        assert!(dir.path().join(LAST_CHECKPOINT).exists());
        Ok(())
    }

    #[test]
    fn test_other_ranks_do_not_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let module = weights();
        let optimizer = module.configure_optimizer();
        let scaler = GradScaler::new(false);
        let mut callback = ModelCheckpoint::new(dir.path(), CheckpointOptions::default());
        let progress = FitProgress { global_step: 1, ..Default::default() };
        let ctx = CallbackContext {
            progress: &progress,
            module: &module,
            optimizer: &optimizer,
            scaler: &scaler,
            role: ProcessRole::new(1, 2),
        };
        callback.on_train_epoch_end(&ctx)?;
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }
}
