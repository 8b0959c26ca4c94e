// src/deps/validator.rs

//! Dependency readiness checks.
//!
//! A dependency is ready for a consuming model when its last run:
//! - succeeded,
//! - finished no longer ago than the consumer's staleness threshold, and
//! - produced at least the consumer's minimum row count.
//!
//! Every violated rule is reported; validation never stops at the first
//! problem.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::cache::ExecutionCache;
use crate::dag::Model;
use crate::deps::metadata::{MetadataStore, RunSummary};
use crate::engine::{AdmissionGate, ExecutionStatus};
use crate::errors::{ModeldagError, Result};
use crate::types::ModelId;

const LAST_RUN_CACHE_PARAMS: &str = "last_run";

/// Why a single dependency is not ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReadyReason {
    NeverRun,
    LastRunNotSucceeded(ExecutionStatus),
    Stale { age: Duration, threshold: Duration },
    InsufficientRows { rows: u64, minimum: u64 },
    MetadataUnavailable(String),
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReadyReason::NeverRun => f.write_str("never run"),
            NotReadyReason::LastRunNotSucceeded(status) => {
                write!(f, "last run {status}")
            }
            NotReadyReason::Stale { age, threshold } => write!(
                f,
                "stale (last success {} ago, threshold {})",
                format_age(*age),
                format_age(*threshold)
            ),
            NotReadyReason::InsufficientRows { rows, minimum } => {
                write!(f, "produced {rows} rows, minimum is {minimum}")
            }
            NotReadyReason::MetadataUnavailable(err) => {
                write!(f, "metadata unavailable: {err}")
            }
        }
    }
}

fn format_age(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Readiness of one declared dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStatus {
    pub dependency: ModelId,
    pub ready: bool,
    /// Age of the last run relative to the validation instant.
    pub staleness: Option<Duration>,
    pub row_count: Option<u64>,
    pub last_success: Option<DateTime<Utc>>,
    pub reasons: Vec<NotReadyReason>,
}

impl DependencyStatus {
    pub fn staleness_minutes(&self) -> Option<u64> {
        self.staleness.map(|d| d.as_secs() / 60)
    }
}

/// Result of validating every dependency of one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub model: ModelId,
    pub as_of: DateTime<Utc>,
    pub statuses: Vec<DependencyStatus>,
    pub all_ready: bool,
}

impl ValidationReport {
    pub fn not_ready(&self) -> impl Iterator<Item = &DependencyStatus> {
        self.statuses.iter().filter(|s| !s.ready)
    }

    pub fn status_of(&self, dependency: &str) -> Option<&DependencyStatus> {
        self.statuses.iter().find(|s| s.dependency == dependency)
    }

    /// One line per not-ready dependency, joined with `; `.
    pub fn describe(&self) -> String {
        self.not_ready()
            .map(|s| {
                let reasons: Vec<String> = s.reasons.iter().map(|r| r.to_string()).collect();
                format!("{}: {}", s.dependency, reasons.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn to_error(&self) -> ModeldagError {
        ModeldagError::DependencyNotReady {
            model: self.model.clone(),
            details: self.describe(),
        }
    }

    /// `Ok(self)` when every dependency is ready, `DependencyNotReady`
    /// otherwise.
    pub fn into_result(self) -> Result<ValidationReport> {
        if self.all_ready {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

/// Checks declared dependencies against the metadata store.
#[derive(Debug, Clone)]
pub struct DependencyValidator {
    store: Arc<dyn MetadataStore>,
    cache: Option<(Arc<ExecutionCache<Option<RunSummary>>>, Duration)>,
}

impl DependencyValidator {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store, cache: None }
    }

    /// Memoize `last_run` lookups for `ttl`.
    pub fn with_cache(
        mut self,
        cache: Arc<ExecutionCache<Option<RunSummary>>>,
        ttl: Duration,
    ) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Drop any memoized lookup for `dep` so the next check reads the store.
    pub fn forget(&self, dep: &str) {
        if let Some((cache, _)) = &self.cache {
            cache.invalidate_model(dep);
        }
    }

    /// Validate every declared dependency of `model` as of `as_of`.
    ///
    /// Store errors do not abort validation; they surface as
    /// [`NotReadyReason::MetadataUnavailable`] on the affected dependency.
    pub fn validate(&self, model: &Model, as_of: DateTime<Utc>) -> Result<ValidationReport> {
        let statuses: Vec<DependencyStatus> = model
            .dependencies
            .iter()
            .map(|dep| self.check_dependency(model, dep, as_of))
            .collect();
        let all_ready = statuses.iter().all(|s| s.ready);

        debug!(
            model = %model.id,
            dependencies = statuses.len(),
            all_ready,
            "validated dependencies"
        );

        Ok(ValidationReport {
            model: model.id.clone(),
            as_of,
            statuses,
            all_ready,
        })
    }

    fn check_dependency(&self, model: &Model, dep: &str, as_of: DateTime<Utc>) -> DependencyStatus {
        let mut status = DependencyStatus {
            dependency: dep.to_string(),
            ready: false,
            staleness: None,
            row_count: None,
            last_success: None,
            reasons: Vec::new(),
        };

        let summary = match self.last_run(dep) {
            Ok(Some(summary)) => summary,
            Ok(None) => {
                status.reasons.push(NotReadyReason::NeverRun);
                return status;
            }
            Err(err) => {
                warn!(model = %model.id, dependency = dep, error = %err, "metadata lookup failed");
                status
                    .reasons
                    .push(NotReadyReason::MetadataUnavailable(err.to_string()));
                return status;
            }
        };

        // Timestamps from the future count as perfectly fresh.
        let age = (as_of - summary.finished_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        status.staleness = Some(age);
        status.row_count = Some(summary.row_count);

        if summary.status == ExecutionStatus::Succeeded {
            status.last_success = Some(summary.finished_at);
        } else {
            status
                .reasons
                .push(NotReadyReason::LastRunNotSucceeded(summary.status));
        }
        if age > model.staleness_threshold {
            status.reasons.push(NotReadyReason::Stale {
                age,
                threshold: model.staleness_threshold,
            });
        }
        if summary.row_count < model.min_rows {
            status.reasons.push(NotReadyReason::InsufficientRows {
                rows: summary.row_count,
                minimum: model.min_rows,
            });
        }

        status.ready = status.reasons.is_empty();
        status
    }

    fn last_run(&self, dep: &str) -> anyhow::Result<Option<RunSummary>> {
        let Some((cache, ttl)) = &self.cache else {
            return self.store.last_run(dep);
        };
        if let Some(hit) = cache.get(dep, LAST_RUN_CACHE_PARAMS) {
            return Ok(hit);
        }
        let fresh = self.store.last_run(dep)?;
        cache.put(dep, LAST_RUN_CACHE_PARAMS, fresh.clone(), *ttl);
        Ok(fresh)
    }
}

/// Admission gate that re-validates a model's dependencies at the instant
/// the scheduler is about to admit it.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    validator: DependencyValidator,
    models: Arc<BTreeMap<ModelId, Model>>,
}

impl ReadinessGate {
    pub fn new(validator: DependencyValidator, models: Arc<BTreeMap<ModelId, Model>>) -> Self {
        Self { validator, models }
    }
}

impl AdmissionGate for ReadinessGate {
    fn admit(&self, model: &str) -> bool {
        // Models the gate knows nothing about are not its business.
        let Some(declared) = self.models.get(model) else {
            return true;
        };
        match self.validator.validate(declared, Utc::now()) {
            Ok(report) => {
                if !report.all_ready {
                    debug!(model, details = %report.describe(), "admission held back");
                }
                report.all_ready
            }
            Err(err) => {
                warn!(model, error = %err, "admission check failed");
                false
            }
        }
    }

    fn record_changed(&self, model: &str) {
        self.validator.forget(model);
    }
}
