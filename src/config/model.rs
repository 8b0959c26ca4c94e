// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::dag::{DEFAULT_MAX_EXECUTION_TIME, DEFAULT_STALENESS_THRESHOLD, Model};
use crate::engine::ResourceVector;
use crate::errors::{ModeldagError, Result};
use crate::types::{FailurePolicy, ModelKind};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [config]
/// failure_policy = "fail-fast"
/// max_parallel_models = 4
///
/// [pool]
/// memory_mb = 16384
/// cpu_cores = 8
///
/// [model.stg_orders]
/// kind = "declarative"
/// cmd = "sqlmesh run --select stg_orders"
/// memory_mb = 4096
///
/// [model.orders_report]
/// after = ["stg_orders"]
/// staleness = "60m"
/// ```
///
/// This is the unvalidated form; convert it with `ConfigFile::try_from`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    /// Total capacity of the resource pool.
    #[serde(default)]
    pub pool: ResourceVector,

    /// All models from `[model.<id>]`, keyed by model id.
    #[serde(default)]
    pub model: BTreeMap<String, ModelConfig>,
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>` (or `new_unchecked` in
/// code that already guarantees the invariants).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub pool: ResourceVector,
    pub model: BTreeMap<String, ModelConfig>,
}

impl ConfigFile {
    pub fn new_unchecked(
        config: ConfigSection,
        pool: ResourceVector,
        model: BTreeMap<String, ModelConfig>,
    ) -> Self {
        Self {
            config,
            pool,
            model,
        }
    }

    /// Convert every `[model.<id>]` section into a [`Model`].
    pub fn to_models(&self) -> Result<Vec<Model>> {
        self.model
            .iter()
            .map(|(id, cfg)| cfg.to_model(id))
            .collect()
    }

    pub fn metadata_cache_ttl(&self) -> Result<Duration> {
        parse_duration(&self.config.metadata_cache_ttl).map_err(|e| {
            ModeldagError::ConfigError(format!("[config].metadata_cache_ttl: {e}"))
        })
    }
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// `"fail-fast"` (default) or `"degrade"`.
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Largest number of models the planner puts in one parallel group.
    #[serde(default = "default_max_parallel_models")]
    pub max_parallel_models: usize,

    /// How long dependency metadata lookups are memoized.
    #[serde(default = "default_metadata_cache_ttl")]
    pub metadata_cache_ttl: String,
}

fn default_max_parallel_models() -> usize {
    4
}

fn default_metadata_cache_ttl() -> String {
    "30s".to_string()
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_parallel_models: default_max_parallel_models(),
            metadata_cache_ttl: default_metadata_cache_ttl(),
        }
    }
}

/// `[model.<id>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelConfig {
    /// `"declarative"` (default) or `"procedural"`.
    #[serde(default)]
    pub kind: ModelKind,

    /// Shell command executed for this model. Models without one succeed
    /// immediately with zero rows.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Upstream models: this model waits for all of them.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub memory_mb: u64,

    #[serde(default)]
    pub cpu_cores: u32,

    #[serde(default)]
    pub gpu_count: u32,

    /// Higher runs first when models compete for capacity.
    #[serde(default)]
    pub priority: i32,

    /// Maximum age of each dependency's last success, e.g. `"60m"`.
    #[serde(default)]
    pub staleness: Option<String>,

    /// Minimum rows each dependency must have produced.
    #[serde(default)]
    pub min_rows: u64,

    /// Upper bound on one execution, e.g. `"30m"`.
    #[serde(default)]
    pub max_execution_time: Option<String>,

    /// Regex whose first capture group is the produced row count.
    #[serde(default)]
    pub rows_pattern: Option<String>,
}

impl ModelConfig {
    pub fn resources(&self) -> ResourceVector {
        ResourceVector::new(self.memory_mb, self.cpu_cores, self.gpu_count)
    }

    pub fn staleness_threshold(&self) -> std::result::Result<Duration, String> {
        self.staleness
            .as_deref()
            .map(parse_duration)
            .unwrap_or(Ok(DEFAULT_STALENESS_THRESHOLD))
    }

    pub fn execution_limit(&self) -> std::result::Result<Duration, String> {
        self.max_execution_time
            .as_deref()
            .map(parse_duration)
            .unwrap_or(Ok(DEFAULT_MAX_EXECUTION_TIME))
    }

    pub fn to_model(&self, id: &str) -> Result<Model> {
        let staleness = self
            .staleness_threshold()
            .map_err(|e| ModeldagError::ConfigError(format!("model '{id}' staleness: {e}")))?;
        let limit = self.execution_limit().map_err(|e| {
            ModeldagError::ConfigError(format!("model '{id}' max_execution_time: {e}"))
        })?;

        let mut model = Model::new(id, self.kind)
            .with_resources(self.resources())
            .with_priority(self.priority)
            .with_staleness_threshold(staleness)
            .with_min_rows(self.min_rows)
            .with_max_execution_time(limit);
        for dep in &self.after {
            model = model.depends_on(dep.clone());
        }
        if let Some(cmd) = &self.cmd {
            model = model.with_command(cmd.clone());
        }
        if let Some(pattern) = &self.rows_pattern {
            model = model.with_rows_pattern(pattern.clone());
        }
        Ok(model)
    }
}

/// Parse durations like `"500ms"`, `"30s"`, `"60m"`, `"2h"` or `"1d"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        "d" => Ok(Duration::from_secs(value * 24 * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, h or d",
            unit
        )),
    }
}
