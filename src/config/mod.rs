//! Run configuration
//!
//! A run is described by one YAML document. Fresh runs merge the file over the
//! compiled-in defaults; resumed runs load the `config.yaml` saved next to the
//! checkpoint verbatim.

pub mod error;
pub mod validate;

pub use error::{ConfigError, ConfigWarning};
pub use validate::verify_config;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::trainers::options::{CheckpointOptions, TrainerOptions};

/// Defaults layer for fresh runs.
pub const DEFAULT_CONFIG: &str = include_str!("defaults.yaml");

/// Name of the effective config persisted in every run directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub project: String,
    pub output_dir: PathBuf,
    pub seed: Option<u64>,
    #[serde(default)]
    pub force_disable_amp: bool,
    pub model: ModelConfig,
    pub optimizer: OptimizerConfig,
    pub data: DataConfig,
    pub prior_preservation: PriorPreservationConfig,
    pub aspect_ratio_bucket: AspectRatioBucketConfig,
    pub sampling: SamplingConfig,
    pub trainer: TrainerOptions,
    pub checkpoint: CheckpointOptions,
    #[serde(default)]
    pub loggers: LoggersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Safetensors weights for the denoiser, keyed like its parameters.
    pub pretrained: Option<PathBuf>,
    pub base_channels: usize,
    pub num_blocks: usize,
    pub num_train_timesteps: usize,
    pub beta_schedule: String,
    pub beta_start: f32,
    pub beta_end: f32,
    /// Min-SNR loss weighting gamma.
    pub snr_gamma: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    #[serde(default)]
    pub warmup_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub resolution: usize,
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub center_crop: bool,
    /// Pre-encoded dataset. When set, `concepts` are not read.
    pub cache: Option<PathBuf>,
    #[serde(default)]
    pub concepts: Vec<Concept>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub instance_set: ImageSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_set: Option<ImageSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSet {
    pub path: PathBuf,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorPreservationConfig {
    pub enabled: bool,
    pub prior_loss_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AspectRatioBucketConfig {
    pub enabled: bool,
    pub min_size: usize,
    pub max_size: usize,
    pub step: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub every_n_steps: Option<usize>,
    pub every_n_epochs: Option<usize>,
    pub num_samples: usize,
    pub num_inference_steps: usize,
    pub seed: u64,
    pub width: Option<usize>,
    pub height: Option<usize>,
}

/// Telemetry sinks. A key that is absent or null is skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensorboard: Option<LoggerSetting<TensorBoardConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wandb: Option<LoggerSetting<WandbConfig>>,
    /// Keys this build has no sink for; kept so they survive persistence.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// A logger entry, either a bare flag (`tensorboard: true`) or its settings.
/// Any present, non-null entry turns the sink on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoggerSetting<T> {
    Flag(bool),
    Settings(T),
}

impl<T: Clone + Default> LoggerSetting<T> {
    /// Settings to build the sink with; defaults for a bare flag.
    pub fn settings(&self) -> T {
        match self {
            LoggerSetting::Flag(_) => T::default(),
            LoggerSetting::Settings(settings) => settings.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TensorBoardConfig {
    /// Subdirectory under the project dir, `lightning_logs` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WandbConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// `output_dir/project`, the root shared by every run of the project.
    pub fn project_dir(&self) -> PathBuf {
        self.output_dir.join(&self.project)
    }

    pub fn have_concepts(&self) -> bool {
        !self.data.concepts.is_empty()
    }

    /// Write the configuration as YAML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Deep-merge `overlay` into `base`. Mappings merge key by key, anything else
/// from the overlay replaces the base value.
pub fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn from_value(path: &Path, value: Value) -> Result<Config, ConfigError> {
    serde_yaml::from_value(value).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// The defaults layer as a YAML tree.
pub fn default_values() -> Value {
    // The embedded document is covered by `test_defaults_parse`.
    serde_yaml::from_str(DEFAULT_CONFIG).unwrap_or(Value::Null)
}

/// Load a config file and merge it over the defaults layer.
pub fn load_with_defaults(path: &Path) -> Result<Config, ConfigError> {
    let overlay = read_yaml(path)?;
    let mut merged = default_values();
    if !overlay.is_null() {
        merge_yaml(&mut merged, overlay);
    }
    from_value(path, merged)
}

/// Load the config saved next to a checkpoint, verbatim.
pub fn get_resuming_config(ckpt_path: &Path) -> Result<Config, ConfigError> {
    let config_yaml = ckpt_path
        .parent()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    if !config_yaml.is_file() {
        return Err(ConfigError::NotFoundForCheckpoint(config_yaml));
    }
    let value = read_yaml(&config_yaml)?;
    from_value(&config_yaml, value)
}

/// Pick the configuration for this process. A config path wins over the
/// checkpoint's saved config when both are given.
pub fn resolve_config(
    config_path: Option<&Path>,
    resume_ckpt_path: Option<&Path>,
) -> Result<Config, ConfigError> {
    match (config_path, resume_ckpt_path) {
        (Some(path), _) => load_with_defaults(path),
        (None, Some(ckpt)) => get_resuming_config(ckpt),
        (None, None) => Err(ConfigError::Missing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::precision::Precision;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_defaults_parse() {
        let config: Config = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.project, "sd-finetune");
        assert!(config.data.concepts.is_empty());
        assert_eq!(config.trainer.precision, Precision::Full);
        assert!(config.loggers.tensorboard.is_none());
    }

    #[test]
    fn test_load_with_defaults_keeps_unspecified_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "base.yaml",
            "project: dogs\ntrainer:\n  max_epochs: 3\ndata:\n  concepts:\n    - instance_set: {path: imgs, prompt: a sks dog}\n",
        );

        let config = load_with_defaults(&path).unwrap();
        assert_eq!(config.project, "dogs");
        assert_eq!(config.trainer.max_epochs, Some(3));
        // untouched keys come from the defaults layer
        assert_eq!(config.trainer.log_every_n_steps, 50);
        assert_eq!(config.data.resolution, 64);
        assert_eq!(config.output_dir, PathBuf::from("output"));
        assert_eq!(config.data.concepts.len(), 1);
    }

    #[test]
    fn test_merge_covers_every_default_key() {
        let mut merged = default_values();
        let overlay: Value = serde_yaml::from_str("model:\n  base_channels: 8\n").unwrap();
        merge_yaml(&mut merged, overlay);

        let defaults = default_values();
        let (Value::Mapping(defaults), Value::Mapping(merged)) = (defaults, merged) else {
            panic!("defaults must be a mapping");
        };
        for (key, value) in &defaults {
            let merged_value = merged.get(key).expect("default key missing after merge");
            if let (Value::Mapping(d), Value::Mapping(m)) = (value, merged_value) {
                for nested in d.keys() {
                    assert!(m.contains_key(nested), "missing nested key {:?}", nested);
                }
            }
        }
        assert_eq!(merged["model"]["base_channels"], Value::from(8));
        assert_eq!(merged["model"]["num_blocks"], Value::from(2));
    }

    #[test]
    fn test_resume_without_sibling_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = write(dir.path(), "last.ckpt", "");

        let err = resolve_config(None, Some(&ckpt)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFoundForCheckpoint(_)));
    }

    #[test]
    fn test_resume_loads_saved_config_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut config: Config = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        config.project = "resumed".to_string();
        config.optimizer.learning_rate = 3.0e-5;
        config.save(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        let ckpt = write(dir.path(), "epoch=0-step=1.ckpt", "");

        let loaded = resolve_config(None, Some(&ckpt)).unwrap();
        assert_eq!(loaded.project, "resumed");
        assert_eq!(loaded.optimizer.learning_rate, 3.0e-5);
    }

    #[test]
    fn test_resume_config_is_not_merged_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), CONFIG_FILE_NAME, "project: partial\n");
        let ckpt = write(dir.path(), "last.ckpt", "");

        let err = get_resuming_config(&ckpt).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_neither_path_is_an_error() {
        assert!(matches!(resolve_config(None, None), Err(ConfigError::Missing)));
    }

    #[test]
    fn test_unknown_trainer_option_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bad.yaml", "trainer:\n  max_epoch: 3\n");

        let err = load_with_defaults(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_unknown_logger_is_kept_but_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "loggers.yaml",
            "loggers:\n  tensorboard: {}\n  comet: {api_key: x}\n",
        );

        let config = load_with_defaults(&path).unwrap();
        assert!(config.loggers.tensorboard.is_some());
        assert!(config.loggers.wandb.is_none());
        assert!(config.loggers.other.contains_key("comet"));
    }

    #[test]
    fn test_logger_entries_accept_flags_and_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "flags.yaml", "loggers:\n  tensorboard: true\n  wandb: {}\n");

        let config = load_with_defaults(&path).unwrap();
        let tensorboard = config.loggers.tensorboard.as_ref().unwrap();
        assert!(matches!(tensorboard, LoggerSetting::Flag(true)));
        assert!(tensorboard.settings().name.is_none());
        let wandb = config.loggers.wandb.as_ref().unwrap();
        assert!(matches!(wandb, LoggerSetting::Settings(_)));
        assert!(wandb.settings().tags.is_empty());

        // a flag survives persistence as a flag
        let saved = dir.path().join(CONFIG_FILE_NAME);
        config.save(&saved).unwrap();
        assert!(fs::read_to_string(&saved).unwrap().contains("tensorboard: true"));
    }

    #[test]
    fn test_logger_settings_mapping_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "named.yaml", "loggers:\n  tensorboard: {name: tb}\n  wandb: null\n");

        let config = load_with_defaults(&path).unwrap();
        let tensorboard = config.loggers.tensorboard.as_ref().unwrap().settings();
        assert_eq!(tensorboard.name.as_deref(), Some("tb"));
        assert!(config.loggers.wandb.is_none());
    }
}
