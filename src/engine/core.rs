// src/engine/core.rs

//! Pure pipeline state machine.
//!
//! [`PipelineCore`] decides *which* models to submit or skip and *when*. It
//! consumes terminal outcomes and produces [`CoreCommand`]s for the async
//! shell in `engine::pipeline`, which does the validation, scheduling and
//! running.
//!
//! The core has no Tokio types, no locks and performs no IO, so the cascade
//! and ordering rules are unit tested directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::dag::DagGraph;
use crate::engine::cascade::cascade_skips;
use crate::engine::record::{ExecutionStatus, SkipCause};
use crate::errors::{ModeldagError, Result};
use crate::types::{FailurePolicy, ModelId};

/// Command produced by the core, executed by the pipeline shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Validate and hand the model to the scheduler.
    Submit(ModelId),
    /// Record the model as skipped; it will never run in this pipeline run.
    Skip { model: ModelId, cause: SkipCause },
}

/// Decision returned after one input to the core.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Every model in the run has reached a terminal status.
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelState {
    /// Some in-run dependency has not finished yet.
    Waiting,
    /// Handed to the shell; waiting for a terminal outcome.
    Submitted,
    Done(ExecutionStatus),
}

#[derive(Debug)]
pub struct PipelineCore {
    graph: Arc<DagGraph>,
    policy: FailurePolicy,
    /// Models taking part in this run, with their state.
    states: BTreeMap<ModelId, ModelState>,
}

impl PipelineCore {
    /// Create a core for the whole graph, or for `selection` plus every
    /// transitive dependent of it.
    ///
    /// Models upstream of a selection are not part of the run; their
    /// readiness comes from metadata history alone.
    pub fn new(
        graph: Arc<DagGraph>,
        policy: FailurePolicy,
        selection: Option<&[ModelId]>,
    ) -> Result<Self> {
        let mut states = BTreeMap::new();

        match selection {
            None => {
                for id in graph.models() {
                    states.insert(id.to_string(), ModelState::Waiting);
                }
            }
            Some(roots) => {
                for root in roots {
                    if !graph.contains(root) {
                        return Err(ModeldagError::ModelNotFound(root.clone()));
                    }
                    states.insert(root.clone(), ModelState::Waiting);
                    for dependent in graph.transitive_dependents(root) {
                        states.insert(dependent, ModelState::Waiting);
                    }
                }
            }
        }

        debug!(models = states.len(), %policy, "initialised pipeline core");

        Ok(Self {
            graph,
            policy,
            states,
        })
    }

    /// Submit every model with no unfinished in-run dependency.
    pub fn start(&mut self) -> CoreStep {
        let commands = self.release_ready();
        CoreStep {
            commands,
            finished: self.is_finished(),
        }
    }

    /// Feed the terminal status of a model.
    ///
    /// Outcomes for models outside the run, or for models that already
    /// finished, are ignored.
    pub fn on_terminal(&mut self, model: &str, status: ExecutionStatus) -> CoreStep {
        let awaiting = matches!(
            self.states.get(model),
            Some(ModelState::Waiting | ModelState::Submitted)
        );
        if !awaiting {
            debug!(model, %status, "ignoring outcome for model not awaiting one");
            return CoreStep {
                commands: Vec::new(),
                finished: self.is_finished(),
            };
        }
        self.states
            .insert(model.to_string(), ModelState::Done(status));

        let mut commands = Vec::new();

        if status != ExecutionStatus::Succeeded {
            let states = &self.states;
            let skips = cascade_skips(&self.graph, model, self.policy, |m| {
                states.get(m) == Some(&ModelState::Waiting)
            });
            for (skipped, cause) in skips {
                self.states
                    .insert(skipped.clone(), ModelState::Done(ExecutionStatus::Skipped));
                commands.push(CoreCommand::Skip {
                    model: skipped,
                    cause,
                });
            }
        }

        commands.extend(self.release_ready());

        CoreStep {
            commands,
            finished: self.is_finished(),
        }
    }

    /// Walk waiting models in topological order and decide the ones whose
    /// in-run dependencies have all finished.
    fn release_ready(&mut self) -> Vec<CoreCommand> {
        let mut commands = Vec::new();
        let ordered: Vec<ModelId> = self
            .graph
            .levels()
            .iter()
            .flatten()
            .filter(|id| self.states.get(*id) == Some(&ModelState::Waiting))
            .cloned()
            .collect();

        for id in ordered {
            let mut blocked = false;
            let mut failed_dep: Option<&ModelId> = None;

            for dep in self.graph.dependencies_of(&id) {
                match self.states.get(dep) {
                    None => {}
                    Some(ModelState::Done(ExecutionStatus::Succeeded)) => {}
                    Some(ModelState::Done(_)) => {
                        failed_dep.get_or_insert(dep);
                    }
                    Some(_) => blocked = true,
                }
            }
            if blocked {
                continue;
            }

            match failed_dep {
                Some(dep) if self.policy == FailurePolicy::FailFast => {
                    let cause = SkipCause::direct(dep.clone());
                    self.states
                        .insert(id.clone(), ModelState::Done(ExecutionStatus::Skipped));
                    commands.push(CoreCommand::Skip { model: id, cause });
                }
                _ => {
                    self.states.insert(id.clone(), ModelState::Submitted);
                    commands.push(CoreCommand::Submit(id));
                }
            }
        }

        commands
    }

    pub fn is_finished(&self) -> bool {
        self.states
            .values()
            .all(|s| matches!(s, ModelState::Done(_)))
    }

    /// Terminal status of a model in this run, if it has one.
    pub fn status_of(&self, model: &str) -> Option<ExecutionStatus> {
        match self.states.get(model) {
            Some(ModelState::Done(status)) => Some(*status),
            _ => None,
        }
    }

    pub fn models_in_run(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(|s| s.as_str())
    }

    /// Models handed to the shell that have not reported back.
    pub fn submitted(&self) -> Vec<ModelId> {
        self.states
            .iter()
            .filter(|(_, s)| **s == ModelState::Submitted)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
