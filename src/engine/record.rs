// src/engine/record.rs

//! Execution records: the per-model audit trail kept by the scheduler.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::ModelId;

/// Lifecycle status of a single model execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    /// Submitted, waiting for capacity (or readiness) to be admitted.
    Queued,
    /// Admitted; resources are allocated and the runner is executing it.
    Running,
    /// Cancellation was requested while running; waiting on the runner.
    Cancelling,
    Succeeded,
    Failed,
    /// Never submitted because an upstream model did not succeed.
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Skipped
                | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Cancelling => "cancelling",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a model was skipped: the model whose failure started the cascade,
/// plus the path from that model down to the skipped model's parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipCause {
    pub root: ModelId,
    /// `[root, ..., direct upstream]`.
    pub chain: Vec<ModelId>,
}

impl SkipCause {
    pub fn direct(root: impl Into<ModelId>) -> Self {
        let root = root.into();
        Self {
            chain: vec![root.clone()],
            root,
        }
    }
}

impl fmt::Display for SkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipped due to {}", self.root)?;
        if self.chain.len() > 1 {
            write!(f, " (via {})", self.chain.join(" -> "))?;
        }
        Ok(())
    }
}

/// What a runner reports back for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunOutcome {
    pub success: bool,
    pub row_count: u64,
    pub error: Option<String>,
    /// The runner aborted the run in response to a cancellation request.
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn succeeded(row_count: u64) -> Self {
        Self {
            success: true,
            row_count,
            error: None,
            cancelled: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            row_count: 0,
            error: Some(error.into()),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            row_count: 0,
            error: Some("cancelled by request".to_string()),
            cancelled: true,
        }
    }
}

/// Audit record of one model execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub model: ModelId,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub row_count: Option<u64>,
    pub error: Option<String>,
    pub skip_cause: Option<SkipCause>,
}

impl ExecutionRecord {
    pub fn queued(model: impl Into<ModelId>, now: DateTime<Utc>) -> Self {
        Self {
            model: model.into(),
            status: ExecutionStatus::Queued,
            submitted_at: now,
            started_at: None,
            ended_at: None,
            row_count: None,
            error: None,
            skip_cause: None,
        }
    }

    /// Terminal record for a model that was rejected before it ever ran.
    pub fn rejected(model: impl Into<ModelId>, error: String, now: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            ended_at: Some(now),
            error: Some(error),
            ..Self::queued(model, now)
        }
    }

    pub fn skipped(model: impl Into<ModelId>, cause: SkipCause, now: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            ended_at: Some(now),
            error: Some(cause.to_string()),
            skip_cause: Some(cause),
            ..Self::queued(model, now)
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(now);
    }

    pub fn finish(&mut self, status: ExecutionStatus, outcome: &RunOutcome, now: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(now);
        if status == ExecutionStatus::Succeeded {
            self.row_count = Some(outcome.row_count);
            self.error = None;
        } else {
            self.error = outcome.error.clone();
        }
    }

    /// Wall-clock time spent running, if the model ever started.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let ended = self.ended_at?;
        (ended - started).to_std().ok()
    }
}
