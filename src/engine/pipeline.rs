// src/engine/pipeline.rs

//! Async shell around [`PipelineCore`].
//!
//! The shell owns everything with side effects:
//! - validating dependencies and publishing readiness events
//! - submitting models to the [`ResourceScheduler`]
//! - spawning one Tokio task per admitted model (start future, runner
//!   under a timeout, `complete`)
//! - feeding terminal events from the bus back into the core
//!
//! The decisions themselves live in the core.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::ExecutionCache;
use crate::dag::{DagBuilder, DagGraph, ExecutionPlan, ExecutionPlanner, Model};
use crate::deps::{DependencyValidator, MemoryMetadataStore, MetadataStore, ReadinessGate};
use crate::engine::core::{CoreCommand, PipelineCore};
use crate::engine::events::{EventCoordinator, EventKind, ModelEvent};
use crate::engine::pool::ResourceVector;
use crate::engine::record::{ExecutionStatus, RunOutcome};
use crate::engine::report::{ModelReport, RunReport};
use crate::engine::scheduler::{CancelOutcome, ExecutionHandle, ResourceScheduler};
use crate::errors::{ModeldagError, Result};
use crate::exec::{RunContext, Runner, RunnerRegistry};
use crate::types::{FailurePolicy, ModelId, ModelKind};

/// How long the mailbox may stay quiet before the driver checks for queued
/// requests that can never be admitted.
const STALL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Default TTL for memoized metadata lookups.
pub const DEFAULT_METADATA_CACHE_TTL: Duration = Duration::from_secs(30);

/// Collects configuration and model registrations for a [`Pipeline`].
pub struct PipelineBuilder {
    capacity: ResourceVector,
    policy: FailurePolicy,
    max_parallel_models: usize,
    metadata_cache_ttl: Duration,
    registry: RunnerRegistry,
    store: Option<Arc<dyn MetadataStore>>,
    bus: Option<EventCoordinator>,
    dag: DagBuilder,
    models: BTreeMap<ModelId, Model>,
    runners: HashMap<ModelId, Arc<dyn Runner>>,
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("models", &self.models.len())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    pub fn new(capacity: ResourceVector) -> Self {
        Self {
            capacity,
            policy: FailurePolicy::default(),
            max_parallel_models: 4,
            metadata_cache_ttl: DEFAULT_METADATA_CACHE_TTL,
            registry: RunnerRegistry::new(),
            store: None,
            bus: None,
            dag: DagBuilder::new(),
            models: BTreeMap::new(),
            runners: HashMap::new(),
        }
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Group size cap used by the execution planner.
    pub fn max_parallel_models(mut self, max: usize) -> Self {
        self.max_parallel_models = max;
        self
    }

    /// TTL for memoized `last_run` lookups; zero disables the cache.
    pub fn metadata_cache_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_cache_ttl = ttl;
        self
    }

    /// Runner for every model of `kind`. Register runners before models.
    pub fn runner(mut self, kind: ModelKind, runner: Arc<dyn Runner>) -> Self {
        self.registry.register(kind, runner);
        self
    }

    pub fn metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_bus(mut self, bus: EventCoordinator) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register a model. Fails on duplicate ids or if no runner handles the
    /// model's kind. Dependencies may name models registered later.
    pub fn register(&mut self, model: Model) -> Result<&mut Self> {
        if self.models.contains_key(&model.id) {
            return Err(ModeldagError::DuplicateModel(model.id));
        }
        let runner = self.registry.resolve(&model)?;
        self.dag
            .add_model(model.id.clone(), model.dependencies.iter().cloned())?;

        debug!(model = %model.id, kind = %model.kind, "registered model");
        self.runners.insert(model.id.clone(), runner);
        self.models.insert(model.id.clone(), model);
        Ok(self)
    }

    pub fn register_all<I>(&mut self, models: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = Model>,
    {
        for model in models {
            self.register(model)?;
        }
        Ok(self)
    }

    /// Validate the graph and wire the collaborators together.
    pub fn build(self) -> Result<Pipeline> {
        let graph = Arc::new(self.dag.build()?);
        let bus = self.bus.unwrap_or_default();
        let store: Arc<dyn MetadataStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryMetadataStore::new()),
        };

        let mut validator = DependencyValidator::new(Arc::clone(&store));
        if !self.metadata_cache_ttl.is_zero() {
            let cache = Arc::new(ExecutionCache::new());
            cache.attach(&bus);
            validator = validator.with_cache(cache, self.metadata_cache_ttl);
        }

        let models = Arc::new(self.models);
        let gate = ReadinessGate::new(validator.clone(), Arc::clone(&models));
        let scheduler = ResourceScheduler::new(self.capacity, bus.clone())
            .with_store(Arc::clone(&store))
            .with_gate(Arc::new(gate));

        info!(
            models = graph.len(),
            levels = graph.levels().len(),
            capacity = %self.capacity,
            policy = %self.policy,
            "pipeline built"
        );

        Ok(Pipeline {
            graph,
            models,
            runners: Arc::new(self.runners),
            scheduler: Arc::new(scheduler),
            validator,
            bus,
            store,
            policy: self.policy,
            planner: ExecutionPlanner::new(self.max_parallel_models),
            halted: Arc::new(AtomicBool::new(false)),
            run_lock: tokio::sync::Mutex::new(()),
        })
    }
}

/// A validated pipeline, ready to run.
pub struct Pipeline {
    graph: Arc<DagGraph>,
    models: Arc<BTreeMap<ModelId, Model>>,
    runners: Arc<HashMap<ModelId, Arc<dyn Runner>>>,
    scheduler: Arc<ResourceScheduler>,
    validator: DependencyValidator,
    bus: EventCoordinator,
    store: Arc<dyn MetadataStore>,
    policy: FailurePolicy,
    planner: ExecutionPlanner,
    halted: Arc<AtomicBool>,
    run_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("models", &self.models.len())
            .field("policy", &self.policy)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    pub fn model(&self, id: &str) -> Option<&Model> {
        self.models.get(id)
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn events(&self) -> &EventCoordinator {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<ResourceScheduler> {
        &self.scheduler
    }

    pub fn metadata_store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Advisory grouping of the graph's levels under the pool capacity.
    pub fn plan(&self) -> ExecutionPlan {
        let models = &self.models;
        self.planner
            .plan(&self.graph, self.scheduler.capacity(), |id| {
                models.get(id).map(|m| m.resources).unwrap_or_default()
            })
    }

    pub fn controller(&self) -> PipelineController {
        PipelineController {
            scheduler: Arc::clone(&self.scheduler),
            runners: Arc::clone(&self.runners),
            halted: Arc::clone(&self.halted),
        }
    }

    /// Run every registered model.
    pub async fn run(&self) -> Result<RunReport> {
        self.run_inner(None).await
    }

    /// Run `roots` plus every model downstream of them.
    pub async fn run_selected(&self, roots: &[ModelId]) -> Result<RunReport> {
        self.run_inner(Some(roots)).await
    }

    async fn run_inner(&self, selection: Option<&[ModelId]>) -> Result<RunReport> {
        let _guard = self.run_lock.lock().await;
        self.halted.store(false, Ordering::SeqCst);

        let mut core = PipelineCore::new(Arc::clone(&self.graph), self.policy, selection)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<(ModelId, ExecutionStatus)>();

        let subscriptions: Vec<_> = [
            EventKind::ModelCompleted,
            EventKind::ModelFailed,
            EventKind::ModelCancelled,
        ]
        .into_iter()
        .map(|kind| {
            let tx = tx.clone();
            self.bus.subscribe(kind, move |event: &ModelEvent| {
                if let Some(status) = event.terminal_status() {
                    tx.send((event.model().to_string(), status))
                        .map_err(|_| anyhow!("pipeline mailbox closed"))?;
                }
                Ok(())
            })
        })
        .collect();

        info!(
            models = core.models_in_run().count(),
            policy = %self.policy,
            "pipeline run started"
        );

        let step = core.start();
        let mut finished = step.finished;
        self.apply(step.commands);

        while !finished {
            match tokio::time::timeout(STALL_CHECK_INTERVAL, rx.recv()).await {
                Ok(Some((model, status))) => {
                    debug!(model = %model, %status, "terminal outcome received");
                    let step = core.on_terminal(&model, status);
                    finished = step.finished;
                    self.apply(step.commands);
                }
                Ok(None) => break,
                Err(_) => self.resolve_stall(),
            }
        }

        for id in subscriptions {
            self.bus.unsubscribe(id);
        }

        let models: Vec<ModelReport> = core
            .models_in_run()
            .filter_map(|id| self.scheduler.record_of(id))
            .map(ModelReport::from)
            .collect();
        let report = RunReport {
            models,
            capacity: self.scheduler.capacity(),
            utilization: self.scheduler.utilization_trace(),
        };

        info!(
            succeeded = report.with_status(ExecutionStatus::Succeeded).len(),
            failed = report.failed().len(),
            skipped = report.skipped().len(),
            cancelled = report.with_status(ExecutionStatus::Cancelled).len(),
            "pipeline run finished"
        );

        Ok(report)
    }

    fn apply(&self, commands: Vec<CoreCommand>) {
        for command in commands {
            match command {
                CoreCommand::Submit(id) => self.submit(&id),
                CoreCommand::Skip { model, cause } => {
                    if let Err(err) = self.scheduler.skip(&model, cause) {
                        warn!(model = %model, error = %err, "failed to record skip");
                    }
                }
            }
        }
    }

    /// Validate, publish readiness, and schedule one model.
    fn submit(&self, id: &str) {
        let (Some(model), Some(runner)) = (self.models.get(id), self.runners.get(id)) else {
            self.reject(id, &ModeldagError::ModelNotFound(id.to_string()));
            return;
        };

        let now = Utc::now();
        let report = match self.validator.validate(model, now) {
            Ok(report) => report,
            Err(err) => {
                self.reject(id, &err);
                return;
            }
        };

        for status in report.not_ready() {
            let reasons: Vec<String> = status.reasons.iter().map(|r| r.to_string()).collect();
            self.bus.publish(ModelEvent::DependencyFailed {
                model: id.to_string(),
                dependency: status.dependency.clone(),
                reason: reasons.join(", "),
                at: now,
            });
        }
        if !report.all_ready {
            self.reject(id, &report.to_error());
            return;
        }
        self.bus.publish(ModelEvent::DependencyReady {
            model: id.to_string(),
            at: now,
        });

        let handle = match self
            .scheduler
            .schedule(id, model.resources, model.priority)
        {
            Ok(handle) => handle,
            Err(err) => {
                self.reject(id, &err);
                return;
            }
        };

        if self.halted.load(Ordering::SeqCst) {
            debug!(model = id, "run halted; cancelling new submission");
            if let Err(err) = self.scheduler.cancel(id) {
                warn!(model = id, error = %err, "failed to cancel model of halted run");
            }
        }

        tokio::spawn(drive_execution(
            Arc::clone(&self.scheduler),
            Arc::clone(runner),
            model.clone(),
            handle,
        ));
    }

    fn reject(&self, id: &str, err: &ModeldagError) {
        if let Err(reject_err) = self.scheduler.reject(id, err) {
            warn!(model = id, error = %reject_err, "failed to record rejection");
        }
    }

    /// Nothing is running but requests are still queued: give the gate one
    /// more chance, then fail whatever it still holds back.
    fn resolve_stall(&self) {
        if self.scheduler.running_count() > 0 {
            return;
        }
        let pending = self.scheduler.pending();
        if pending.is_empty() || !self.scheduler.reevaluate().is_empty() {
            return;
        }

        let now = Utc::now();
        for id in pending {
            let err = match self.models.get(&id) {
                Some(model) => match self.validator.validate(model, now) {
                    Ok(report) if !report.all_ready => report.to_error(),
                    Ok(_) => ModeldagError::DependencyNotReady {
                        model: id.clone(),
                        details: "admission was refused while nothing else was running".into(),
                    },
                    Err(err) => err,
                },
                None => ModeldagError::ModelNotFound(id.clone()),
            };
            warn!(model = %id, error = %err, "queued model can never be admitted");
            self.reject(&id, &err);
        }
    }
}

/// Wait for admission, run the model under its time limit and report back.
async fn drive_execution(
    scheduler: Arc<ResourceScheduler>,
    runner: Arc<dyn Runner>,
    model: Model,
    handle: ExecutionHandle,
) {
    match handle.started().await {
        ExecutionStatus::Running => {}
        ExecutionStatus::Cancelling => {
            if let Err(err) = scheduler.complete(&model.id, RunOutcome::cancelled()) {
                warn!(model = %model.id, error = %err, "failed to complete cancelled model");
            }
            return;
        }
        status => {
            debug!(model = %model.id, %status, "model finished without being admitted");
            return;
        }
    }

    let limit = model.max_execution_time;
    let ctx = RunContext::for_model(&model);

    let (outcome, timed_out) = match tokio::time::timeout(limit, runner.execute(ctx)).await {
        Ok(Ok(outcome)) => (outcome, false),
        Ok(Err(err)) => {
            warn!(model = %model.id, error = %err, "runner failed");
            (RunOutcome::failed(err.to_string()), false)
        }
        Err(_) => {
            let err = ModeldagError::ExecutionTimeout {
                model: model.id.clone(),
                limit,
            };
            warn!(model = %model.id, ?limit, "model exceeded its execution time");
            (RunOutcome::failed(err.to_string()), true)
        }
    };

    if let Err(err) = scheduler.complete(&model.id, outcome) {
        warn!(model = %model.id, error = %err, "failed to complete model");
    }

    // Resources are already released; the runner stops in its own time.
    if timed_out {
        tokio::spawn(async move {
            let acknowledged = runner.cancel(&model.id).await;
            debug!(model = %model.id, acknowledged, "timed-out run cancelled");
        });
    }
}

/// Cloneable handle for cancelling models of a running pipeline.
#[derive(Clone)]
pub struct PipelineController {
    scheduler: Arc<ResourceScheduler>,
    runners: Arc<HashMap<ModelId, Arc<dyn Runner>>>,
    halted: Arc<AtomicBool>,
}

impl fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineController")
            .field("halted", &self.halted.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    /// Cancel one model: queued requests are dropped, running ones are
    /// forwarded to their runner.
    pub async fn cancel(&self, model: &str) -> Result<CancelOutcome> {
        let outcome = self.scheduler.cancel(model)?;
        if outcome == CancelOutcome::Cancelling {
            if let Some(runner) = self.runners.get(model) {
                let forwarded = runner.cancel(model).await;
                debug!(model, forwarded, "cancellation forwarded to runner");
            }
        }
        Ok(outcome)
    }

    /// Cancel everything in flight and stop submitting new models for the
    /// current run.
    pub async fn cancel_all(&self) -> Vec<(ModelId, CancelOutcome)> {
        self.halt();
        let mut outcomes = Vec::new();
        for model in self.scheduler.in_flight_models() {
            match self.cancel(&model).await {
                Ok(outcome) => outcomes.push((model, outcome)),
                Err(err) => warn!(model = %model, error = %err, "failed to cancel model"),
            }
        }
        info!(cancelled = outcomes.len(), "cancelled all in-flight models");
        outcomes
    }

    /// Stop the current run from starting anything new. Models submitted
    /// from now on are cancelled as soon as they are scheduled; models
    /// already in flight keep running.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            info!("pipeline halted");
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}
