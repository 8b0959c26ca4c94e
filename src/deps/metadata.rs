// src/deps/metadata.rs

//! Metadata store abstraction.
//!
//! The coordinator never owns run history; it asks a [`MetadataStore`] what
//! happened last time and reports every finished execution back to it.
//! [`MemoryMetadataStore`] is the in-process default used by the CLI and
//! the tests.

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::engine::{ExecutionRecord, ExecutionStatus};
use crate::types::ModelId;

/// Summary of a model's most recent finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub finished_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub row_count: u64,
    pub duration: Duration,
}

impl RunSummary {
    pub fn succeeded(finished_at: DateTime<Utc>, row_count: u64) -> Self {
        Self {
            finished_at,
            status: ExecutionStatus::Succeeded,
            row_count,
            duration: Duration::ZERO,
        }
    }

    pub fn failed(finished_at: DateTime<Utc>) -> Self {
        Self {
            finished_at,
            status: ExecutionStatus::Failed,
            row_count: 0,
            duration: Duration::ZERO,
        }
    }

    /// Build a summary from a finished record; `None` for records that never
    /// ran (queued, skipped or cancelled before start).
    pub fn from_record(record: &ExecutionRecord) -> Option<Self> {
        let finished_at = record.ended_at?;
        if !matches!(
            record.status,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed
        ) {
            return None;
        }
        Some(Self {
            finished_at,
            status: record.status,
            row_count: record.row_count.unwrap_or(0),
            duration: record.duration().unwrap_or_default(),
        })
    }
}

/// Trait abstracting where run history lives.
///
/// Implementations are synchronous; the validator calls them on the
/// scheduling path and they are expected to be quick.
pub trait MetadataStore: Send + Sync + Debug {
    /// Last finished run of `model`, or `None` if it never ran.
    fn last_run(&self, model: &str) -> Result<Option<RunSummary>>;

    /// Persist a terminal execution record.
    fn record_run(&self, model: &str, record: &ExecutionRecord) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    last_runs: HashMap<ModelId, RunSummary>,
    history: Vec<ExecutionRecord>,
}

/// In-memory store: keeps every record plus the latest run summary per model.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    state: Mutex<MemoryState>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the last run of a model, e.g. history from an external
    /// system or a previous process.
    pub fn seed(&self, model: impl Into<ModelId>, summary: RunSummary) {
        self.state.lock().last_runs.insert(model.into(), summary);
    }

    /// Every record passed to `record_run`, in arrival order.
    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.state.lock().history.clone()
    }

    pub fn history_of(&self, model: &str) -> Vec<ExecutionRecord> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|r| r.model == model)
            .cloned()
            .collect()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn last_run(&self, model: &str) -> Result<Option<RunSummary>> {
        Ok(self.state.lock().last_runs.get(model).cloned())
    }

    fn record_run(&self, model: &str, record: &ExecutionRecord) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(summary) = RunSummary::from_record(record) {
            state.last_runs.insert(model.to_string(), summary);
        }
        state.history.push(record.clone());
        Ok(())
    }
}
