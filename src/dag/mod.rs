// src/dag/mod.rs

//! Model graph and execution planning.
//!
//! - [`model`] describes a single data model and its requirements.
//! - [`graph`] validates registrations and computes topological levels.
//! - [`planner`] packs each level into resource-bounded parallel groups.

pub mod graph;
pub mod model;
pub mod planner;

pub use graph::{DagBuilder, DagGraph};
pub use model::{DEFAULT_MAX_EXECUTION_TIME, DEFAULT_STALENESS_THRESHOLD, Model};
pub use planner::{ExecutionPlan, ExecutionPlanner, ParallelGroup, PlanLevel};
