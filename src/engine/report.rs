// src/engine/report.rs

//! End-of-run summary.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::engine::pool::ResourceVector;
use crate::engine::record::{ExecutionRecord, ExecutionStatus, SkipCause};
use crate::engine::scheduler::UtilizationSample;
use crate::types::ModelId;

/// Final state of one model in a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReport {
    pub model: ModelId,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub skip_cause: Option<SkipCause>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub row_count: Option<u64>,
}

impl From<ExecutionRecord> for ModelReport {
    fn from(record: ExecutionRecord) -> Self {
        Self {
            model: record.model,
            status: record.status,
            error: record.error,
            skip_cause: record.skip_cause,
            started_at: record.started_at,
            ended_at: record.ended_at,
            row_count: record.row_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// One entry per model in the run, in id order.
    pub models: Vec<ModelReport>,
    pub capacity: ResourceVector,
    pub utilization: Vec<UtilizationSample>,
}

impl RunReport {
    pub fn get(&self, model: &str) -> Option<&ModelReport> {
        self.models.iter().find(|m| m.model == model)
    }

    pub fn status_of(&self, model: &str) -> Option<ExecutionStatus> {
        self.get(model).map(|m| m.status)
    }

    pub fn all_succeeded(&self) -> bool {
        self.models
            .iter()
            .all(|m| m.status == ExecutionStatus::Succeeded)
    }

    pub fn with_status(&self, status: ExecutionStatus) -> Vec<&ModelReport> {
        self.models.iter().filter(|m| m.status == status).collect()
    }

    pub fn failed(&self) -> Vec<&ModelReport> {
        self.with_status(ExecutionStatus::Failed)
    }

    pub fn skipped(&self) -> Vec<&ModelReport> {
        self.with_status(ExecutionStatus::Skipped)
    }

    /// Component-wise maximum allocation seen during the run.
    pub fn peak_allocation(&self) -> ResourceVector {
        self.utilization
            .iter()
            .fold(ResourceVector::ZERO, |acc, s| acc.max(&s.allocated))
    }

    /// Largest number of models running at the same time.
    pub fn peak_running(&self) -> usize {
        self.utilization.iter().map(|s| s.running).max().unwrap_or(0)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .models
            .iter()
            .map(|m| m.model.len())
            .max()
            .unwrap_or(5)
            .max(5);

        writeln!(f, "{:<width$}  {:<10}  {:>8}  detail", "model", "status", "rows")?;
        for m in &self.models {
            let rows = m.row_count.map(|r| r.to_string()).unwrap_or_default();
            let detail = m.error.as_deref().unwrap_or("");
            writeln!(
                f,
                "{:<width$}  {:<10}  {:>8}  {}",
                m.model,
                m.status.to_string(),
                rows,
                detail
            )?;
        }
        write!(
            f,
            "peak allocation {} of {} ({} running at most)",
            self.peak_allocation(),
            self.capacity,
            self.peak_running()
        )
    }
}
