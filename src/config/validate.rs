// src/config/validate.rs

use regex::Regex;

use crate::config::model::{ConfigFile, RawConfigFile, parse_duration};
use crate::dag::DagBuilder;
use crate::errors::{ModeldagError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::ModeldagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.config, raw.pool, raw.model))
    }
}

/// Run every semantic check on a parsed (but unvalidated) config.
pub fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_models(cfg)?;
    validate_global_config(cfg)?;
    validate_pool(cfg)?;
    validate_models(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_models(cfg: &RawConfigFile) -> Result<()> {
    if cfg.model.is_empty() {
        return Err(ModeldagError::ConfigError(
            "config must contain at least one [model.<id>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.config.max_parallel_models == 0 {
        return Err(ModeldagError::ConfigError(
            "[config].max_parallel_models must be >= 1 (got 0)".to_string(),
        ));
    }
    parse_duration(&cfg.config.metadata_cache_ttl).map_err(|e| {
        ModeldagError::ConfigError(format!("[config].metadata_cache_ttl: {e}"))
    })?;
    Ok(())
}

fn validate_pool(cfg: &RawConfigFile) -> Result<()> {
    if cfg.pool.memory_mb == 0 {
        return Err(ModeldagError::ConfigError(
            "[pool].memory_mb must be > 0".to_string(),
        ));
    }
    if cfg.pool.cpu_cores == 0 {
        return Err(ModeldagError::ConfigError(
            "[pool].cpu_cores must be > 0".to_string(),
        ));
    }
    Ok(())
}

const MODEL_ID_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.-]*$";

fn validate_models(cfg: &RawConfigFile) -> Result<()> {
    let id_re = Regex::new(MODEL_ID_PATTERN)
        .map_err(|e| ModeldagError::ConfigError(format!("invalid model id pattern: {e}")))?;

    for (id, model) in &cfg.model {
        if !id_re.is_match(id) {
            return Err(ModeldagError::ConfigError(format!(
                "invalid model id '{}': must start with a letter or '_' and contain only letters, digits, '_', '.' or '-'",
                id
            )));
        }

        model
            .staleness_threshold()
            .map_err(|e| ModeldagError::ConfigError(format!("model '{id}' staleness: {e}")))?;

        let limit = model.execution_limit().map_err(|e| {
            ModeldagError::ConfigError(format!("model '{id}' max_execution_time: {e}"))
        })?;
        if limit.is_zero() {
            return Err(ModeldagError::ConfigError(format!(
                "model '{}' max_execution_time must be > 0",
                id
            )));
        }

        if let Some(pattern) = &model.rows_pattern {
            let re = Regex::new(pattern).map_err(|e| {
                ModeldagError::ConfigError(format!(
                    "model '{}' has an invalid rows_pattern '{}': {}",
                    id, pattern, e
                ))
            })?;
            if re.captures_len() < 2 {
                return Err(ModeldagError::ConfigError(format!(
                    "model '{}' rows_pattern '{}' needs a capture group for the row count",
                    id, pattern
                )));
            }
        }
    }
    Ok(())
}

/// Unknown references and cycles are reported with the same errors the
/// pipeline builder uses.
fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    let mut builder = DagBuilder::new();
    for (id, model) in &cfg.model {
        builder.add_model(id.as_str(), model.after.iter().map(String::as_str))?;
    }
    builder.build()?;
    Ok(())
}
