#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use modeldag::config::{ConfigFile, ConfigSection, ModelConfig, RawConfigFile};
use modeldag::dag::Model;
use modeldag::engine::ResourceVector;
use modeldag::types::{FailurePolicy, ModelKind};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    /// Starts with a 16GB / 8 core pool.
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                pool: ResourceVector::gb(16, 8, 0),
                model: BTreeMap::new(),
            },
        }
    }

    pub fn with_pool(mut self, pool: ResourceVector) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.config.failure_policy = policy;
        self
    }

    pub fn with_max_parallel_models(mut self, max: usize) -> Self {
        self.config.config.max_parallel_models = max;
        self
    }

    pub fn with_model(mut self, id: &str, model: ModelConfig) -> Self {
        self.config.model.insert(id.to_string(), model);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a `[model.<id>]` section.
pub struct ModelConfigBuilder {
    model: ModelConfig,
}

impl ModelConfigBuilder {
    pub fn new() -> Self {
        Self {
            model: ModelConfig {
                kind: ModelKind::Declarative,
                ..ModelConfig::default()
            },
        }
    }

    pub fn cmd(mut self, cmd: &str) -> Self {
        self.model.cmd = Some(cmd.to_string());
        self
    }

    pub fn procedural(mut self) -> Self {
        self.model.kind = ModelKind::Procedural;
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.model.after.push(dep.to_string());
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.model.memory_mb = mb;
        self
    }

    pub fn cpu_cores(mut self, cores: u32) -> Self {
        self.model.cpu_cores = cores;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.model.priority = priority;
        self
    }

    pub fn staleness(mut self, s: &str) -> Self {
        self.model.staleness = Some(s.to_string());
        self
    }

    pub fn min_rows(mut self, rows: u64) -> Self {
        self.model.min_rows = rows;
        self
    }

    pub fn max_execution_time(mut self, s: &str) -> Self {
        self.model.max_execution_time = Some(s.to_string());
        self
    }

    pub fn rows_pattern(mut self, pattern: &str) -> Self {
        self.model.rows_pattern = Some(pattern.to_string());
        self
    }

    pub fn build(self) -> ModelConfig {
        self.model
    }
}

impl Default for ModelConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand for declaring `Model`s in pipeline tests.
///
/// Defaults to a declarative model needing 1GB and one core.
pub struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            model: Model::declarative(id).with_resources(ResourceVector::gb(1, 1, 0)),
        }
    }

    pub fn procedural(mut self) -> Self {
        self.model.kind = ModelKind::Procedural;
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        for dep in deps {
            self.model = self.model.depends_on(*dep);
        }
        self
    }

    pub fn memory_gb(mut self, gb: u64) -> Self {
        self.model.resources.memory_mb = gb * 1024;
        self
    }

    pub fn cpu_cores(mut self, cores: u32) -> Self {
        self.model.resources.cpu_cores = cores;
        self
    }

    pub fn gpus(mut self, gpus: u32) -> Self {
        self.model.resources.gpu_count = gpus;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.model = self.model.with_priority(priority);
        self
    }

    pub fn staleness_minutes(mut self, minutes: u64) -> Self {
        self.model = self
            .model
            .with_staleness_threshold(Duration::from_secs(minutes * 60));
        self
    }

    pub fn min_rows(mut self, rows: u64) -> Self {
        self.model = self.model.with_min_rows(rows);
        self
    }

    pub fn max_execution_time(mut self, limit: Duration) -> Self {
        self.model = self.model.with_max_execution_time(limit);
        self
    }

    pub fn build(self) -> Model {
        self.model
    }
}
