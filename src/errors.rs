// src/errors.rs

//! Crate-wide error type and result alias.

use std::time::Duration;

use thiserror::Error;

use crate::engine::ResourceVector;
use crate::types::{ModelId, ModelKind};

#[derive(Error, Debug)]
pub enum ModeldagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("model '{0}' is already registered")]
    DuplicateModel(ModelId),

    #[error("model '{model}' depends on unknown model '{dependency}'")]
    UnknownDependency { model: ModelId, dependency: ModelId },

    #[error("cycle detected in model DAG involving model '{model}' (cycle members: {})", .members.join(", "))]
    Cycle { model: ModelId, members: Vec<ModelId> },

    #[error("model '{model}' requires {requirement} but the pool capacity is {capacity}")]
    ResourceExceeded {
        model: ModelId,
        requirement: ResourceVector,
        capacity: ResourceVector,
    },

    #[error("dependencies of model '{model}' are not ready: {details}")]
    DependencyNotReady { model: ModelId, details: String },

    #[error("model '{model}' exceeded its maximum execution time of {limit:?}")]
    ExecutionTimeout { model: ModelId, limit: Duration },

    #[error("{message}")]
    Runner { model: ModelId, message: String },

    #[error("no runner registered for {kind} models (model '{model}')")]
    NoRunner { model: ModelId, kind: ModelKind },

    #[error("Model not found: {0}")]
    ModelNotFound(ModelId),

    #[error("model '{0}' has no queued or running execution")]
    NotInFlight(ModelId),

    #[error("model '{0}' is already running")]
    AlreadyRunning(ModelId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ModeldagError>;
