//! Weights & Biases offline run directory
//!
//! Writes the files an offline W&B run keeps under
//! `wandb/offline-run-<time>-<id>/files/` so the run can be synced later.

use anyhow::{Context, Result};
use chrono::Local;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{Metrics, TrainLogger};
use crate::config::WandbConfig;

pub struct WandbLogger {
    save_dir: PathBuf,
    project: String,
    options: WandbConfig,
    run_id: String,
    files_dir: Option<PathBuf>,
    history: Option<File>,
    summary: Map<String, Value>,
    started: Option<Instant>,
}

impl WandbLogger {
    pub fn new(save_dir: &Path, project: &str, options: &WandbConfig) -> Self {
        let run_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        Self {
            save_dir: save_dir.to_path_buf(),
            project: project.to_string(),
            options: options.clone(),
            run_id,
            files_dir: None,
            history: None,
            summary: Map::new(),
            started: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run `files/` directory, created on first use.
    pub fn files_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.files_dir {
            return Ok(dir.clone());
        }
        let now = Local::now();
        let run_dir = self.save_dir.join("wandb").join(format!(
            "offline-run-{}-{}",
            now.format("%Y%m%d_%H%M%S"),
            self.run_id
        ));
        let dir = run_dir.join("files");
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create W&B directory: {}", dir.display()))?;

        self.started = Some(Instant::now());
        self.files_dir = Some(dir.clone());
        self.write_metadata(&now.to_rfc3339(), "running")?;
        Ok(dir)
    }

    fn write_metadata(&self, started_at: &str, state: &str) -> Result<()> {
        let Some(dir) = &self.files_dir else {
            return Ok(());
        };
        let metadata = json!({
            "project": self.project,
            "name": self.options.name.clone().unwrap_or_else(|| self.run_id.clone()),
            "id": self.run_id,
            "tags": self.options.tags,
            "startedAt": started_at,
            "state": state,
            "mode": "offline",
            "program": std::env::args().next().unwrap_or_default(),
            "args": std::env::args().skip(1).collect::<Vec<_>>(),
        });
        let path = dir.join("wandb-metadata.json");
        fs::write(&path, serde_json::to_string_pretty(&metadata)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn runtime(&self) -> f64 {
        self.started.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0)
    }
}

impl TrainLogger for WandbLogger {
    fn name(&self) -> &str {
        "wandb"
    }

    fn log_hyperparams(&mut self, params: &Value) -> Result<()> {
        let path = self.files_dir()?.join("config.yaml");

        // W&B stores each top-level key as {desc, value}
        let mut config = serde_yaml::Mapping::new();
        config.insert("wandb_version".into(), 1.into());
        if let Value::Object(map) = params {
            for (key, value) in map {
                let mut entry = serde_yaml::Mapping::new();
                entry.insert("desc".into(), serde_yaml::Value::Null);
                entry.insert("value".into(), serde_yaml::to_value(value)?);
                config.insert(key.as_str().into(), entry.into());
            }
        }
        fs::write(&path, serde_yaml::to_string(&config)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn log_metrics(&mut self, metrics: &Metrics, step: usize) -> Result<()> {
        let dir = self.files_dir()?;
        if self.history.is_none() {
            let path = dir.join("wandb-history.jsonl");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            self.history = Some(file);
        }

        let mut row = Map::new();
        for (key, value) in metrics {
            row.insert(key.clone(), json!(value));
            self.summary.insert(key.clone(), json!(value));
        }
        row.insert("_step".to_string(), json!(step));
        row.insert("_timestamp".to_string(), json!(Local::now().timestamp_millis() as f64 / 1000.0));
        row.insert("_runtime".to_string(), json!(self.runtime()));
        self.summary.insert("_step".to_string(), json!(step));

        if let Some(history) = self.history.as_mut() {
            writeln!(history, "{}", Value::Object(row))?;
        }
        Ok(())
    }

    fn finalize(&mut self, status: &str) -> Result<()> {
        if self.files_dir.is_none() {
            return Ok(());
        }
        let dir = self.files_dir()?;
        let mut summary = self.summary.clone();
        summary.insert("_wandb".to_string(), json!({ "runtime": self.runtime() }));
        let path = dir.join("wandb-summary.json");
        fs::write(&path, serde_json::to_string(&Value::Object(summary))?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        if let Some(mut history) = self.history.take() {
            history.flush()?;
        }
        let state = if status == "success" { "finished" } else { "failed" };
        self.write_metadata(&Local::now().to_rfc3339(), state)?;
        log::info!("W&B offline run saved to {}", dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_files_dir(root: &Path) -> PathBuf {
        let runs: Vec<PathBuf> = fs::read_dir(root.join("wandb"))
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        assert_eq!(runs.len(), 1);
        runs[0].join("files")
    }

    #[test]
    fn test_offline_run_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = WandbConfig {
            name: Some("first".to_string()),
            tags: vec!["dreambooth".to_string()],
        };
        let mut logger = WandbLogger::new(dir.path(), "dogs", &options);
        assert!(!dir.path().join("wandb").exists());

        logger.log_hyperparams(&json!({"optimizer": {"learning_rate": 0.001}}))?;
        let mut metrics = Metrics::new();
        metrics.insert("train_loss".to_string(), 0.5);
        logger.log_metrics(&metrics, 1)?;
        metrics.insert("train_loss".to_string(), 0.25);
        logger.log_metrics(&metrics, 2)?;
        logger.finalize("success")?;

        let files = run_files_dir(dir.path());
        let run_dir_name = files.parent().unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert!(run_dir_name.starts_with("offline-run-"));
        assert!(run_dir_name.ends_with(logger.run_id()));

        let history = fs::read_to_string(files.join("wandb-history.jsonl"))?;
        let rows: Vec<Value> = history.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["_step"], json!(2));

        let summary: Value = serde_json::from_str(&fs::read_to_string(files.join("wandb-summary.json"))?)?;
        assert_eq!(summary["train_loss"], json!(0.25));

        let metadata: Value = serde_json::from_str(&fs::read_to_string(files.join("wandb-metadata.json"))?)?;
        assert_eq!(metadata["project"], json!("dogs"));
        assert_eq!(metadata["state"], json!("finished"));

        let config = fs::read_to_string(files.join("config.yaml"))?;
        assert!(config.contains("wandb_version: 1"));
        assert!(config.contains("learning_rate: 0.001"));
        Ok(())
    }
}
