// src/dag/model.rs

//! Static model declarations.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::engine::ResourceVector;
use crate::types::{ModelId, ModelKind};

/// Default freshness window for upstream data.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Default upper bound on a single execution.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(60 * 60);

/// A registered transformation model. Immutable once registered.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub id: ModelId,
    pub kind: ModelKind,
    /// Upstream models that must be ready before this one may run.
    pub dependencies: BTreeSet<ModelId>,
    pub resources: ResourceVector,
    /// Higher runs first when several requests compete for capacity.
    pub priority: i32,
    /// How old a dependency's last successful run may be.
    pub staleness_threshold: Duration,
    /// Minimum rows each dependency must have produced.
    pub min_rows: u64,
    pub max_execution_time: Duration,
    /// Shell command executed by the command runner, if any.
    pub command: Option<String>,
    /// Regex with one capture group extracting the produced row count from
    /// the command's stdout.
    pub rows_pattern: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<ModelId>, kind: ModelKind) -> Self {
        Self {
            id: id.into(),
            kind,
            dependencies: BTreeSet::new(),
            resources: ResourceVector::ZERO,
            priority: 0,
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
            min_rows: 0,
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            command: None,
            rows_pattern: None,
        }
    }

    pub fn declarative(id: impl Into<ModelId>) -> Self {
        Self::new(id, ModelKind::Declarative)
    }

    pub fn procedural(id: impl Into<ModelId>) -> Self {
        Self::new(id, ModelKind::Procedural)
    }

    pub fn depends_on(mut self, dep: impl Into<ModelId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceVector) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    pub fn with_min_rows(mut self, min_rows: u64) -> Self {
        self.min_rows = min_rows;
        self
    }

    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = limit;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_rows_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.rows_pattern = Some(pattern.into());
        self
    }
}
