//! Configuration errors and non-fatal findings

use std::path::PathBuf;

/// Fatal configuration problems. All of them abort the run before any
/// checkpoint can be written.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("either --resume or --config must be specified")]
    Missing,
    #[error("config not found for the checkpoint specified: {}", .0.display())]
    NotFoundForCheckpoint(PathBuf),
    #[error("no concept found and cache file is not specified")]
    NoConceptNoCache,
    #[error("prior preservation loss is enabled, but concept #{index} has no class set specified")]
    MissingClassSet { index: usize },
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("failed to write config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Non-fatal findings reported by `verify_config`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Concepts are set but the cache takes precedence.
    #[error("One or more concept is set, but won't be used as cache is specified")]
    ConceptsIgnored,
    /// Prior preservation is off but these concepts declare a class set.
    #[error("Prior preservation loss is disabled, but there's concept with class set specified (concepts {concepts:?})")]
    UnusedClassSet { concepts: Vec<usize> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_messages() {
        assert_eq!(
            ConfigWarning::ConceptsIgnored.to_string(),
            "One or more concept is set, but won't be used as cache is specified"
        );
        let warning = ConfigWarning::UnusedClassSet { concepts: vec![0, 2] };
        assert!(warning.to_string().ends_with("(concepts [0, 2])"));
        assert!(ConfigError::MissingClassSet { index: 1 }.to_string().contains("concept #1"));
    }
}
