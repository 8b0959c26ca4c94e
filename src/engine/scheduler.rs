// src/engine/scheduler.rs

//! Resource-aware admission control.
//!
//! The [`ResourceScheduler`] owns the only [`ResourcePool`] and the queue of
//! submissions waiting for capacity. Every state transition happens under a
//! single lock; events and metadata writes happen after it is released.
//!
//! Admission is reactive: a request runs as soon as it fits and its gate
//! passes, and every release re-walks the queue in priority order.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::deps::MetadataStore;
use crate::engine::events::{EventCoordinator, ModelEvent};
use crate::engine::pool::{ResourcePool, ResourceVector};
use crate::engine::queue::PendingQueue;
use crate::engine::record::{ExecutionRecord, ExecutionStatus, RunOutcome, SkipCause};
use crate::errors::{ModeldagError, Result};
use crate::types::ModelId;

/// Last check before a request is admitted, evaluated at the admission
/// instant while the scheduler lock is held.
pub trait AdmissionGate: Send + Sync + Debug {
    fn admit(&self, model: &str) -> bool;

    /// Called once a new record for `model` has been persisted, before the
    /// queue is re-walked.
    fn record_changed(&self, _model: &str) {}
}

/// Gate that admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl AdmissionGate for OpenGate {
    fn admit(&self, _model: &str) -> bool {
        true
    }
}

/// One point of the resource-utilization trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtilizationSample {
    pub at: DateTime<Utc>,
    pub allocated: ResourceVector,
    pub running: usize,
    pub queued: usize,
}

/// Result of [`ResourceScheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was still queued and is now cancelled.
    Cancelled,
    /// The model is running; the runner has been asked to stop.
    Cancelling,
    /// Nothing to cancel; the model already reached this status.
    AlreadyFinished(ExecutionStatus),
}

/// Cloneable view of one in-flight execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    model: ModelId,
    rx: watch::Receiver<ExecutionStatus>,
}

impl ExecutionHandle {
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Current status without waiting.
    pub fn status(&self) -> ExecutionStatus {
        *self.rx.borrow()
    }

    /// Resolves once the execution leaves `Queued`.
    pub async fn started(&self) -> ExecutionStatus {
        self.wait_until(|s| *s != ExecutionStatus::Queued).await
    }

    /// Resolves with the terminal status.
    pub async fn finished(&self) -> ExecutionStatus {
        self.wait_until(|s| s.is_terminal()).await
    }

    /// Whether both handles track the same in-flight execution.
    pub fn same_execution(&self, other: &ExecutionHandle) -> bool {
        self.rx.same_channel(&other.rx)
    }

    async fn wait_until<F>(&self, predicate: F) -> ExecutionStatus
    where
        F: FnMut(&ExecutionStatus) -> bool,
    {
        let mut rx = self.rx.clone();
        let reached = rx.wait_for(predicate).await.map(|s| *s);
        // A closed channel still holds the last status that was sent.
        match reached {
            Ok(status) => status,
            Err(_) => *rx.borrow(),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    status_tx: watch::Sender<ExecutionStatus>,
    requirement: ResourceVector,
    record: ExecutionRecord,
}

impl InFlight {
    fn handle(&self) -> ExecutionHandle {
        ExecutionHandle {
            model: self.record.model.clone(),
            rx: self.status_tx.subscribe(),
        }
    }

    fn set_status(&mut self, status: ExecutionStatus) {
        self.record.status = status;
        self.status_tx.send_replace(status);
    }
}

#[derive(Debug)]
struct SchedulerState {
    pool: ResourcePool,
    queue: PendingQueue,
    in_flight: HashMap<ModelId, InFlight>,
    finished: Vec<ExecutionRecord>,
    trace: Vec<UtilizationSample>,
}

impl SchedulerState {
    fn running_count(&self) -> usize {
        self.in_flight
            .values()
            .filter(|f| f.record.status != ExecutionStatus::Queued)
            .count()
    }

    fn sample(&mut self, at: DateTime<Utc>) {
        let sample = UtilizationSample {
            at,
            allocated: self.pool.allocated(),
            running: self.running_count(),
            queued: self.queue.len(),
        };
        self.trace.push(sample);
    }

    /// Admit every queued request that fits and passes the gate, in
    /// priority order.
    fn admit_pending(&mut self, gate: &dyn AdmissionGate, now: DateTime<Utc>) -> Vec<ModelId> {
        let SchedulerState {
            pool,
            queue,
            in_flight,
            ..
        } = self;

        let admitted = queue.drain_admissible(|entry| {
            pool.can_fit_now(&entry.requirement)
                && gate.admit(&entry.model)
                && pool.try_allocate(&entry.requirement)
        });

        let mut ids = Vec::with_capacity(admitted.len());
        for entry in admitted {
            if let Some(flight) = in_flight.get_mut(&entry.model) {
                flight.record.mark_running(now);
                flight.set_status(ExecutionStatus::Running);
            }
            ids.push(entry.model);
        }
        ids
    }
}

/// Owns the resource pool and decides when submissions run.
#[derive(Debug)]
pub struct ResourceScheduler {
    state: Mutex<SchedulerState>,
    bus: EventCoordinator,
    store: Option<Arc<dyn MetadataStore>>,
    gate: Arc<dyn AdmissionGate>,
}

impl ResourceScheduler {
    pub fn new(capacity: ResourceVector, bus: EventCoordinator) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                pool: ResourcePool::new(capacity),
                queue: PendingQueue::new(),
                in_flight: HashMap::new(),
                finished: Vec::new(),
                trace: Vec::new(),
            }),
            bus,
            store: None,
            gate: Arc::new(OpenGate),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Persist every terminal record to `store`.
    pub fn with_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Submit a model for execution. Never blocks.
    ///
    /// - already queued or running: returns the existing handle
    /// - larger than the whole pool: `ResourceExceeded`, nothing is queued
    /// - fits now and the gate passes: allocated and marked running
    /// - otherwise: queued by priority
    pub fn schedule(
        &self,
        model: &str,
        requirement: ResourceVector,
        priority: i32,
    ) -> Result<ExecutionHandle> {
        let now = Utc::now();
        let mut state = self.state.lock();

        if let Some(existing) = state.in_flight.get(model) {
            debug!(model, status = %existing.record.status, "already in flight; reusing handle");
            return Ok(existing.handle());
        }

        if !state.pool.can_ever_fit(&requirement) {
            let capacity = state.pool.capacity();
            warn!(
                model,
                %requirement,
                %capacity,
                exceeded = ?requirement.exceeded_dimensions(&capacity),
                "requirement exceeds pool capacity"
            );
            return Err(ModeldagError::ResourceExceeded {
                model: model.to_string(),
                requirement,
                capacity,
            });
        }

        let (status_tx, _) = watch::channel(ExecutionStatus::Queued);
        let mut flight = InFlight {
            status_tx,
            requirement,
            record: ExecutionRecord::queued(model, now),
        };

        let admitted = state.pool.can_fit_now(&requirement)
            && self.gate.admit(model)
            && state.pool.try_allocate(&requirement);

        if admitted {
            flight.record.mark_running(now);
            flight.set_status(ExecutionStatus::Running);
        } else {
            state.queue.push(model, requirement, priority);
        }

        let handle = flight.handle();
        state.in_flight.insert(model.to_string(), flight);
        state.sample(now);
        let allocated = state.pool.allocated();
        drop(state);

        if admitted {
            info!(model, %requirement, %allocated, "admitted model");
            self.bus.publish(ModelEvent::ModelStarted {
                model: model.to_string(),
                at: now,
            });
        } else {
            debug!(model, priority, %requirement, "model waiting for capacity");
        }

        Ok(handle)
    }

    /// Report the outcome of a running model.
    ///
    /// Releases its allocation, finalizes the record, then admits every
    /// queued request that now fits. Returns the ids admitted on this call.
    pub fn complete(&self, model: &str, outcome: RunOutcome) -> Result<Vec<ModelId>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let running = state
            .in_flight
            .get(model)
            .is_some_and(|f| f.record.status != ExecutionStatus::Queued);
        if !running {
            return Err(ModeldagError::NotInFlight(model.to_string()));
        }
        let Some(mut flight) = state.in_flight.remove(model) else {
            return Err(ModeldagError::NotInFlight(model.to_string()));
        };

        let was_cancelling = flight.record.status == ExecutionStatus::Cancelling;
        let status = if outcome.cancelled {
            ExecutionStatus::Cancelled
        } else if was_cancelling || !outcome.success {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Succeeded
        };

        let mut outcome = outcome;
        if status == ExecutionStatus::Failed && outcome.error.is_none() {
            outcome.error = Some(if was_cancelling {
                "cancellation requested; runner finished without cancelling".into()
            } else {
                "runner reported failure".into()
            });
        }

        state.pool.release(&flight.requirement);
        flight.record.finish(status, &outcome, now);
        flight.set_status(status);
        let record = flight.record.clone();
        state.finished.push(flight.record);

        // Gates consult the store, so the outcome must be visible first.
        self.persist(&record);
        let admitted = state.admit_pending(self.gate.as_ref(), now);
        state.sample(now);
        let allocated = state.pool.allocated();
        drop(state);

        info!(
            model,
            %status,
            rows = ?record.row_count,
            %allocated,
            admitted = admitted.len(),
            "model finished"
        );

        self.bus.publish(terminal_event(&record, now));
        self.announce_started(&admitted, now);

        Ok(admitted)
    }

    /// Cancel a queued or running model.
    pub fn cancel(&self, model: &str) -> Result<CancelOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let Some(current) = state.in_flight.get(model).map(|f| f.record.status) else {
            let last = state
                .finished
                .iter()
                .rev()
                .find(|r| r.model == model)
                .map(|r| r.status);
            return match last {
                Some(status) => Ok(CancelOutcome::AlreadyFinished(status)),
                None => Err(ModeldagError::NotInFlight(model.to_string())),
            };
        };

        match current {
            ExecutionStatus::Queued => {
                state.queue.remove(model);
                let Some(mut flight) = state.in_flight.remove(model) else {
                    return Err(ModeldagError::NotInFlight(model.to_string()));
                };
                flight
                    .record
                    .finish(ExecutionStatus::Cancelled, &RunOutcome::cancelled(), now);
                flight.set_status(ExecutionStatus::Cancelled);
                let record = flight.record.clone();
                state.finished.push(flight.record);
                state.sample(now);
                drop(state);

                info!(model, "cancelled queued model");
                self.persist(&record);
                self.bus.publish(terminal_event(&record, now));
                Ok(CancelOutcome::Cancelled)
            }
            _ => {
                if let Some(flight) = state.in_flight.get_mut(model) {
                    flight.set_status(ExecutionStatus::Cancelling);
                }
                info!(model, "cancellation requested for running model");
                Ok(CancelOutcome::Cancelling)
            }
        }
    }

    /// Record a model that was refused before it ever ran (failed
    /// validation, unsatisfiable requirement, stuck in the queue).
    pub fn reject(&self, model: &str, error: &ModeldagError) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let record = match state.in_flight.get(model).map(|f| f.record.status) {
            Some(ExecutionStatus::Queued) => {
                state.queue.remove(model);
                let Some(mut flight) = state.in_flight.remove(model) else {
                    return Err(ModeldagError::NotInFlight(model.to_string()));
                };
                flight.record.finish(
                    ExecutionStatus::Failed,
                    &RunOutcome::failed(error.to_string()),
                    now,
                );
                flight.set_status(ExecutionStatus::Failed);
                flight.record
            }
            Some(_) => return Err(ModeldagError::AlreadyRunning(model.to_string())),
            None => ExecutionRecord::rejected(model, error.to_string(), now),
        };

        state.finished.push(record.clone());
        state.sample(now);
        drop(state);

        warn!(model, error = %error, "model rejected");
        self.persist(&record);
        self.bus.publish(terminal_event(&record, now));
        Ok(())
    }

    /// Record a model that will never be submitted because an upstream
    /// model did not succeed.
    pub fn skip(&self, model: &str, cause: SkipCause) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        if state.in_flight.contains_key(model) {
            return Err(ModeldagError::AlreadyRunning(model.to_string()));
        }
        let record = ExecutionRecord::skipped(model, cause.clone(), now);
        state.finished.push(record.clone());
        drop(state);

        info!(model, %cause, "model skipped");
        self.persist(&record);
        self.bus.publish(ModelEvent::ModelSkipped {
            model: model.to_string(),
            cause,
            at: now,
        });
        Ok(())
    }

    /// Re-walk the queue, e.g. after external metadata changed.
    pub fn reevaluate(&self) -> Vec<ModelId> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let admitted = state.admit_pending(self.gate.as_ref(), now);
        if !admitted.is_empty() {
            state.sample(now);
        }
        drop(state);

        self.announce_started(&admitted, now);
        admitted
    }

    fn persist(&self, record: &ExecutionRecord) {
        if let Some(store) = &self.store {
            if let Err(err) = store.record_run(&record.model, record) {
                warn!(model = %record.model, error = %err, "failed to persist execution record");
            }
        }
        self.gate.record_changed(&record.model);
    }

    fn announce_started(&self, admitted: &[ModelId], at: DateTime<Utc>) {
        for model in admitted {
            info!(model = %model, "admitted queued model");
            self.bus.publish(ModelEvent::ModelStarted {
                model: model.clone(),
                at,
            });
        }
    }

    pub fn utilization_trace(&self) -> Vec<UtilizationSample> {
        self.state.lock().trace.clone()
    }

    /// Finished records followed by in-flight ones.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        let state = self.state.lock();
        let mut in_flight: Vec<ExecutionRecord> =
            state.in_flight.values().map(|f| f.record.clone()).collect();
        in_flight.sort_by(|a, b| a.model.cmp(&b.model));
        state.finished.iter().cloned().chain(in_flight).collect()
    }

    /// The in-flight record for `model`, or its latest finished one.
    pub fn record_of(&self, model: &str) -> Option<ExecutionRecord> {
        let state = self.state.lock();
        state
            .in_flight
            .get(model)
            .map(|f| f.record.clone())
            .or_else(|| state.finished.iter().rev().find(|r| r.model == model).cloned())
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running_count()
    }

    /// Queued model ids in admission order.
    pub fn pending(&self) -> Vec<ModelId> {
        self.state.lock().queue.models()
    }

    pub fn in_flight_models(&self) -> Vec<ModelId> {
        let mut models: Vec<ModelId> = self.state.lock().in_flight.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn capacity(&self) -> ResourceVector {
        self.state.lock().pool.capacity()
    }

    pub fn allocated(&self) -> ResourceVector {
        self.state.lock().pool.allocated()
    }
}

fn terminal_event(record: &ExecutionRecord, at: DateTime<Utc>) -> ModelEvent {
    let model = record.model.clone();
    match record.status {
        ExecutionStatus::Succeeded => ModelEvent::ModelCompleted {
            model,
            row_count: record.row_count.unwrap_or(0),
            at,
        },
        ExecutionStatus::Cancelled => ModelEvent::ModelCancelled { model, at },
        _ => ModelEvent::ModelFailed {
            model,
            error: record.error.clone().unwrap_or_default(),
            at,
        },
    }
}
