// src/deps/mod.rs

//! Dependency readiness: run history and validation against it.

pub mod metadata;
pub mod validator;

pub use metadata::{MemoryMetadataStore, MetadataStore, RunSummary};
pub use validator::{
    DependencyStatus, DependencyValidator, NotReadyReason, ReadinessGate, ValidationReport,
};
