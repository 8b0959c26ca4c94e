// src/engine/mod.rs

//! Execution engine for modeldag.
//!
//! This module ties together:
//! - the resource pool and the admission-control scheduler
//! - execution records and run reports
//! - the lifecycle event bus and the failure cascade policy
//! - the pipeline driver that reacts to terminal outcomes
//!
//! The pure pipeline state machine lives in [`core`]; the async shell is
//! implemented in [`pipeline`].

pub mod cascade;
pub mod core;
pub mod events;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod record;
pub mod report;
pub mod scheduler;

pub use core::{CoreCommand, CoreStep, PipelineCore};
pub use events::{EventCoordinator, EventKind, ModelEvent, SubscriptionId};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineController};
pub use pool::{ResourcePool, ResourceVector};
pub use queue::{PendingEntry, PendingQueue};
pub use record::{ExecutionRecord, ExecutionStatus, RunOutcome, SkipCause};
pub use report::{ModelReport, RunReport};
pub use scheduler::{
    AdmissionGate, CancelOutcome, ExecutionHandle, OpenGate, ResourceScheduler,
    UtilizationSample,
};
