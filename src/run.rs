//! Run identity and the per-run output directory

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Config, CONFIG_FILE_NAME};

/// Format of generated run ids: fixed width and lexically sortable.
pub const RUN_ID_FORMAT: &str = "%y%m%d-%H%M%S";

/// Run id derived from the current local time.
pub fn generate_run_id() -> String {
    chrono::Local::now().format(RUN_ID_FORMAT).to_string()
}

/// `output_dir/project/run_id`, holding the effective config, checkpoints and samples.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    run_id: String,
    path: PathBuf,
}

impl RunDirectory {
    /// Resolve the run directory, using `run_id` unmodified when given.
    pub fn resolve(config: &Config, run_id: Option<String>) -> Self {
        let run_id = run_id.unwrap_or_else(generate_run_id);
        let path = config.project_dir().join(&run_id);
        Self { run_id, path }
    }

    /// Create the directory and its parents. Existing directories are fine.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.path)
            .with_context(|| format!("Failed to create run directory: {}", self.path.display()))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.path.join("samples")
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE_NAME)
    }
}
