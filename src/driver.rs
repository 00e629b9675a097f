//! Command-line run driver
//!
//! Resolves the configuration, wires loggers, callbacks and the trainer,
//! builds the model and hands it to `Trainer::fit`. The run moves through
//! `RunState` strictly in order; any error moves it to `Failed`.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::config::{resolve_config, verify_config};
use crate::distributed::ProcessRole;
use crate::loggers::get_loggers;
use crate::models::StableDiffusionModel;
use crate::run::RunDirectory;
use crate::trainers::{
    Callback, ModelCheckpoint, PrecisionPolicy, SampleCallback, Trainer, TrainerFlags, TuneResult,
};

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "trainer", about = "Fine-tune a diffusion image model from a YAML config")]
pub struct TrainArgs {
    /// Training config, merged over the built-in defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run id, defaults to the current local time
    #[arg(long)]
    pub run_id: Option<String>,

    /// Checkpoint to resume from. Its directory must hold the run's config.yaml
    #[arg(long)]
    pub resume: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    ConfigResolved,
    LoggersReady,
    TrainerReady,
    Validated,
    Seeded,
    ModelReady,
    Tuned,
    ResumeSkipTune,
    Persisted,
    Fitting,
    Complete,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed)
    }

    /// Allowed transitions: the next state in sequence, or `Failed` from any
    /// state that is not terminal.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Init, ConfigResolved)
                | (ConfigResolved, LoggersReady)
                | (LoggersReady, TrainerReady)
                | (TrainerReady, Validated)
                | (Validated, Seeded)
                | (Seeded, ModelReady)
                | (ModelReady, Tuned)
                | (ModelReady, ResumeSkipTune)
                | (Tuned, Persisted)
                | (ResumeSkipTune, Persisted)
                | (Persisted, Fitting)
                | (Fitting, Complete)
        )
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub state: RunState,
    pub seed: u64,
    /// `None` when resuming.
    pub tuned: Option<TuneResult>,
}

fn advance(state: &mut RunState, next: RunState) -> Result<()> {
    if !state.can_advance_to(next) {
        bail!("Invalid run state transition {:?} -> {:?}", state, next);
    }
    log::debug!("Run state {:?} -> {:?}", state, next);
    *state = next;
    Ok(())
}

/// Run one training job end to end.
pub fn run(args: &TrainArgs) -> Result<RunReport> {
    let mut state = RunState::Init;
    let result = execute(args, &mut state);
    if let Err(err) = &result {
        log::error!("Run failed in state {:?}: {:#}", state, err);
        let _ = advance(&mut state, RunState::Failed);
    }
    result
}

fn execute(args: &TrainArgs, state: &mut RunState) -> Result<RunReport> {
    if let Some(resume) = &args.resume {
        if !resume.is_file() {
            bail!("Checkpoint not found: {}", resume.display());
        }
    }

    let mut config = resolve_config(args.config.as_deref(), args.resume.as_deref())?;
    let role = ProcessRole::from_env();
    advance(state, RunState::ConfigResolved)?;

    let loggers = get_loggers(&config)?;
    let run_dir = RunDirectory::resolve(&config, args.run_id.clone());
    run_dir.create()?;
    crate::rank_zero_info!(role, "Run ID: {}", run_dir.run_id());
    advance(state, RunState::LoggersReady)?;

    let callbacks: Vec<Box<dyn Callback>> = vec![
        Box::new(ModelCheckpoint::new(run_dir.path(), config.checkpoint.clone())),
        Box::new(SampleCallback::new(run_dir.samples_dir(), config.sampling.clone())),
    ];
    let flags = TrainerFlags::for_bucketing(config.aspect_ratio_bucket.enabled);
    let policy = PrecisionPolicy::from_config(config.trainer.precision, config.force_disable_amp);
    let mut trainer = Trainer::new(config.trainer.clone(), flags, policy, loggers, callbacks, role)?;
    advance(state, RunState::TrainerReady)?;

    verify_config(&config, &role)?;
    advance(state, RunState::Validated)?;

    let seed = match config.seed {
        Some(seed) => {
            crate::rank_zero_info!(role, "Global seed set to {}", seed);
            seed
        }
        None => rand::random(),
    };
    advance(state, RunState::Seeded)?;

    let mut model = StableDiffusionModel::from_config(&config, trainer.device(), seed)?;
    if config.force_disable_amp {
        crate::rank_zero_info!(role, "Using direct cast, forcibly disabling AMP");
        if trainer.policy().parameter_dtype().is_none() {
            crate::rank_zero_warn!(role, "Precision {} has no reduced dtype, parameters stay float32", config.trainer.precision);
        }
    }
    trainer.policy().apply(&mut model)?;
    advance(state, RunState::ModelReady)?;

    let tuned = if args.resume.is_none() {
        let result = trainer.tune(&mut model)?;
        if let Some(lr) = result.learning_rate {
            config.optimizer.learning_rate = lr;
        }
        if let Some(batch_size) = result.batch_size {
            config.data.batch_size = batch_size;
        }
        advance(state, RunState::Tuned)?;
        Some(result)
    } else {
        crate::rank_zero_info!(role, "Resuming, will not tune hyperparams");
        advance(state, RunState::ResumeSkipTune)?;
        None
    };

    if role.is_coordinator() {
        config.save(&run_dir.config_path())?;
    }
    advance(state, RunState::Persisted)?;

    advance(state, RunState::Fitting)?;
    trainer.fit(&mut model, args.resume.as_deref())?;
    advance(state, RunState::Complete)?;

    Ok(RunReport {
        run_id: run_dir.run_id().to_string(),
        run_dir: run_dir.path().to_path_buf(),
        state: *state,
        seed,
        tuned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{get_resuming_config, ConfigError, CONFIG_FILE_NAME};
    use image::{Rgb, RgbImage};
    use std::fs;
    use std::path::Path;

    fn write_images(dir: &Path, count: usize, color: [u8; 3]) {
        fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            let img = RgbImage::from_fn(12, 10, |x, y| {
                Rgb([color[0], color[1].wrapping_add((x * 10) as u8), color[2].wrapping_add((y * 10) as u8)])
            });
            img.save(dir.join(format!("img_{}.png", i))).unwrap();
        }
    }

    fn base_config(root: &Path, concepts: &str, extra: &str) -> PathBuf {
        let yaml = format!(
            "project: e2e
output_dir: {out}
seed: 7
model:
  base_channels: 8
  num_blocks: 1
  num_train_timesteps: 100
data:
  resolution: 8
  concepts:
{concepts}
sampling:
  every_n_epochs: null
trainer:
  max_epochs: null
  max_steps: 2
  log_every_n_steps: 1
  accelerator: cpu
  enable_progress_bar: false
loggers:
  tensorboard: {{}}
{extra}",
            out = root.join("out").display(),
            concepts = concepts,
            extra = extra,
        );
        let path = root.join("base.yaml");
        fs::write(&path, yaml).unwrap();
        path
    }

    fn instance_concept(root: &Path, name: &str) -> String {
        let dir = root.join(name);
        write_images(&dir, 2, [200, 40, 40]);
        format!("    - instance_set: {{path: {}, prompt: a photo of sks {}}}\n", dir.display(), name)
    }

    #[test]
    fn test_state_transitions_are_sequential() {
        assert!(RunState::Init.can_advance_to(RunState::ConfigResolved));
        assert!(!RunState::Init.can_advance_to(RunState::TrainerReady));
        assert!(RunState::ModelReady.can_advance_to(RunState::Tuned));
        assert!(RunState::ModelReady.can_advance_to(RunState::ResumeSkipTune));
        assert!(!RunState::Tuned.can_advance_to(RunState::ResumeSkipTune));
        assert!(RunState::Seeded.can_advance_to(RunState::Failed));
        assert!(!RunState::Complete.can_advance_to(RunState::Failed));
        assert!(!RunState::Persisted.can_advance_to(RunState::Complete));
    }

    #[test]
    fn test_fresh_run_persists_config_and_trains() -> Result<()> {
        let root = tempfile::tempdir()?;
        let concepts = instance_concept(root.path(), "dog");
        let config_path = base_config(root.path(), &concepts, "");

        let args = TrainArgs { config: Some(config_path), ..Default::default() };
        let report = run(&args)?;

        assert_eq!(report.state, RunState::Complete);
        assert_eq!(report.seed, 7);
        assert!(report.tuned.is_some());
        let project_dir = root.path().join("out").join("e2e");
        assert_eq!(report.run_dir, project_dir.join(&report.run_id));
        assert!(report.run_dir.join(CONFIG_FILE_NAME).is_file());
        assert!(report.run_dir.join("last.ckpt").is_file());
        assert!(project_dir.join("lightning_logs").join("version_0").is_dir());

        // the persisted config is complete and loads verbatim
        let saved = get_resuming_config(&report.run_dir.join("last.ckpt"))?;
        assert_eq!(saved.data.resolution, 8);
        assert_eq!(saved.trainer.max_steps, Some(2));
        Ok(())
    }

    #[test]
    fn test_resume_from_last_checkpoint() -> Result<()> {
        let root = tempfile::tempdir()?;
        let concepts = instance_concept(root.path(), "cat");
        let config_path = base_config(root.path(), &concepts, "");

        let first = run(&TrainArgs {
            config: Some(config_path),
            run_id: Some("first".to_string()),
            ..Default::default()
        })?;
        let ckpt = first.run_dir.join("last.ckpt");

        // raise the step budget in the saved config, then resume from it
        let mut saved = get_resuming_config(&ckpt)?;
        saved.trainer.max_steps = Some(4);
        saved.save(&first.run_dir.join(CONFIG_FILE_NAME))?;

        let second = run(&TrainArgs {
            run_id: Some("second".to_string()),
            resume: Some(ckpt),
            ..Default::default()
        })?;
        assert_eq!(second.state, RunState::Complete);
        assert!(second.tuned.is_none());
        assert!(second.run_dir.join(CONFIG_FILE_NAME).is_file());
        assert!(second.run_dir.join("epoch=1-step=4.ckpt").is_file());
        Ok(())
    }

    #[test]
    fn test_resume_without_sibling_config_fails_before_side_effects() {
        let root = tempfile::tempdir().unwrap();
        let ckpt_dir = root.path().join("old");
        fs::create_dir_all(&ckpt_dir).unwrap();
        let ckpt = ckpt_dir.join("ckpt.pt");
        fs::write(&ckpt, b"not a checkpoint").unwrap();

        let err = run(&TrainArgs { resume: Some(ckpt), ..Default::default() }).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::NotFoundForCheckpoint(_))
        ));
        let entries: Vec<_> = fs::read_dir(root.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_prior_preservation_requires_every_class_set() {
        let root = tempfile::tempdir().unwrap();
        let class_dir = root.path().join("dogs");
        write_images(&class_dir, 2, [40, 40, 200]);
        let mut concepts = instance_concept(root.path(), "dog");
        concepts.push_str(&format!("      class_set: {{path: {}, prompt: a photo of a dog}}\n", class_dir.display()));
        concepts.push_str(&instance_concept(root.path(), "cat"));
        let config_path = base_config(root.path(), &concepts, "prior_preservation:\n  enabled: true\n");

        let err = run(&TrainArgs { config: Some(config_path), ..Default::default() }).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingClassSet { index: 1 })
        ));

        // only the run directory and lazy loggers precede validation
        let project_dir = root.path().join("out").join("e2e");
        let runs: Vec<_> = fs::read_dir(&project_dir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(runs.len(), 1);
        assert_eq!(fs::read_dir(runs[0].path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_config_and_resume() {
        let err = run(&TrainArgs::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::Missing)));
    }
}
