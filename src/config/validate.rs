//! Cross-field checks that run once per process group, before the model exists.

use log::{info, warn};

use super::{Config, ConfigError, ConfigWarning};
use crate::distributed::ProcessRole;

/// Check concept/cache/prior-preservation consistency.
///
/// Only the coordinator evaluates the rules; other ranks get an empty
/// warning list so a launch reports each finding once. Warnings are logged
/// and also returned.
pub fn verify_config(
    config: &Config,
    role: &ProcessRole,
) -> Result<Vec<ConfigWarning>, ConfigError> {
    if !role.is_coordinator() {
        return Ok(Vec::new());
    }

    let mut warnings = Vec::new();
    let concepts = &config.data.concepts;
    let have_concepts = config.have_concepts();

    if have_concepts && config.data.cache.is_some() {
        warnings.push(ConfigWarning::ConceptsIgnored);
    } else if !have_concepts && config.data.cache.is_none() {
        return Err(ConfigError::NoConceptNoCache);
    }

    if !config.prior_preservation.enabled {
        info!("Running: Standard Finetuning");
        let with_class_set: Vec<usize> = concepts
            .iter()
            .enumerate()
            .filter(|(_, concept)| concept.class_set.is_some())
            .map(|(i, _)| i)
            .collect();
        if !with_class_set.is_empty() {
            warnings.push(ConfigWarning::UnusedClassSet {
                concepts: with_class_set,
            });
        }
    } else if let Some(index) = concepts.iter().position(|c| c.class_set.is_none()) {
        return Err(ConfigError::MissingClassSet { index });
    } else {
        info!("Running: DreamBooth with prior preservation loss");
    }

    for warning in &warnings {
        warn!("{}", warning);
    }
    Ok(warnings)
}
