// src/exec/runner.rs

//! Pluggable model runner abstraction.
//!
//! The pipeline never executes a model itself; it hands a [`RunContext`] to
//! the [`Runner`] registered for the model's kind. Production uses
//! [`CommandRunner`](super::command::CommandRunner); tests register fakes
//! that script outcomes without spawning processes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::dag::Model;
use crate::engine::RunOutcome;
use crate::errors::{ModeldagError, Result};
use crate::types::{ModelId, ModelKind};

/// Everything a runner needs to execute one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub model: ModelId,
    pub kind: ModelKind,
    pub command: Option<String>,
    pub rows_pattern: Option<String>,
    pub dependencies: Vec<ModelId>,
}

impl RunContext {
    pub fn for_model(model: &Model) -> Self {
        Self {
            model: model.id.clone(),
            kind: model.kind,
            command: model.command.clone(),
            rows_pattern: model.rows_pattern.clone(),
            dependencies: model.dependencies.iter().cloned().collect(),
        }
    }
}

/// Trait abstracting how a model is executed.
pub trait Runner: Send + Sync {
    /// Execute the model and report its outcome.
    ///
    /// `Err` means the runner itself broke; its message is recorded verbatim
    /// as the model's failure. A model that ran and failed is reported as
    /// `Ok` with an unsuccessful [`RunOutcome`].
    fn execute(
        &self,
        ctx: RunContext,
    ) -> Pin<Box<dyn Future<Output = Result<RunOutcome>> + Send + '_>>;

    /// Ask a running execution to stop. Returns whether anything was
    /// running for `model`. Advisory: the outcome still arrives through
    /// `execute`.
    fn cancel(&self, model: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Maps each model kind to the runner that executes it.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<ModelKind, Arc<dyn Runner>>,
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&ModelKind> = self.runners.keys().collect();
        kinds.sort();
        f.debug_struct("RunnerRegistry").field("kinds", &kinds).finish()
    }
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the runner for `kind`.
    pub fn register(&mut self, kind: ModelKind, runner: Arc<dyn Runner>) {
        self.runners.insert(kind, runner);
    }

    pub fn get(&self, kind: ModelKind) -> Option<Arc<dyn Runner>> {
        self.runners.get(&kind).cloned()
    }

    /// Runner for `model`, or `NoRunner` if its kind has none.
    pub fn resolve(&self, model: &Model) -> Result<Arc<dyn Runner>> {
        self.get(model.kind).ok_or_else(|| ModeldagError::NoRunner {
            model: model.id.clone(),
            kind: model.kind,
        })
    }
}
