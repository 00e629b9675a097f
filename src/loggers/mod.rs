//! Telemetry sinks
//!
//! Sinks are created from the `loggers` section of the config and rooted at
//! `output_dir/project`. They are lazy: nothing touches the disk until the
//! first hyperparameter or metric write.

pub mod tensorboard;
pub mod wandb;

pub use tensorboard::TensorBoardLogger;
pub use wandb::WandbLogger;

use anyhow::Result;
use std::collections::BTreeMap;

use crate::config::{Config, LoggerSetting};

/// Scalar metrics for one step, keyed by name.
pub type Metrics = BTreeMap<String, f64>;

pub trait TrainLogger {
    fn name(&self) -> &str;

    fn log_hyperparams(&mut self, params: &serde_json::Value) -> Result<()>;

    fn log_metrics(&mut self, metrics: &Metrics, step: usize) -> Result<()>;

    /// Flush and close. `status` is `success` or `failed`.
    fn finalize(&mut self, status: &str) -> Result<()>;
}

/// One sink per recognized, non-null key: tensorboard first, then wandb.
pub fn get_loggers(config: &Config) -> Result<Vec<Box<dyn TrainLogger>>> {
    let project_dir = config.project_dir();
    let mut loggers: Vec<Box<dyn TrainLogger>> = Vec::new();

    if let Some(options) = config.loggers.tensorboard.as_ref().map(LoggerSetting::settings) {
        loggers.push(Box::new(TensorBoardLogger::new(&project_dir, &options)));
    }
    if let Some(options) = config.loggers.wandb.as_ref().map(LoggerSetting::settings) {
        loggers.push(Box::new(WandbLogger::new(&project_dir, &config.project, &options)));
    }
    for key in config.loggers.other.keys() {
        log::debug!("No logger named {:?}, ignoring it", key);
    }

    Ok(loggers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFIG;

    fn config_with(loggers: &str) -> Config {
        let mut config: Config = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        config.loggers = serde_yaml::from_str(loggers).unwrap();
        config
    }

    #[test]
    fn test_order_and_skipping() {
        let loggers = get_loggers(&config_with("wandb: {}\ntensorboard: {}\n")).unwrap();
        let names: Vec<&str> = loggers.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["tensorboard", "wandb"]);

        let loggers = get_loggers(&config_with("tensorboard: null\nwandb: {}\n")).unwrap();
        assert_eq!(loggers.len(), 1);
        assert_eq!(loggers[0].name(), "wandb");

        let loggers = get_loggers(&config_with("{}")).unwrap();
        assert!(loggers.is_empty());
    }

    #[test]
    fn test_flag_values_build_sinks() {
        let loggers = get_loggers(&config_with("tensorboard: true\nwandb: {}\n")).unwrap();
        let names: Vec<&str> = loggers.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["tensorboard", "wandb"]);

        let loggers = get_loggers(&config_with("tensorboard: null\nwandb: true\n")).unwrap();
        assert_eq!(loggers.len(), 1);
        assert_eq!(loggers[0].name(), "wandb");
    }

    #[test]
    fn test_unknown_logger_is_ignored() {
        let loggers = get_loggers(&config_with("mlflow: {uri: x}\n")).unwrap();
        assert!(loggers.is_empty());
    }

    #[test]
    fn test_construction_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with("tensorboard: {}\nwandb: {}\n");
        config.output_dir = dir.path().to_path_buf();
        let loggers = get_loggers(&config).unwrap();
        assert_eq!(loggers.len(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
