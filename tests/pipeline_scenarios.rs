use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use modeldag::dag::Model;
use modeldag::deps::{MemoryMetadataStore, MetadataStore, RunSummary};
use modeldag::engine::{
    CancelOutcome, EventKind, ExecutionRecord, ExecutionStatus, ModelEvent, Pipeline,
    PipelineBuilder, ResourceVector, RunOutcome,
};
use modeldag::errors::ModeldagError;
use modeldag::exec::{RunContext, Runner};
use modeldag::types::{FailurePolicy, ModelKind};
use modeldag_test_utils::{FakeRunner, ModelBuilder, init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn build(
    capacity: ResourceVector,
    policy: FailurePolicy,
    runner: &Arc<FakeRunner>,
    store: Option<Arc<MemoryMetadataStore>>,
    models: Vec<Model>,
) -> Pipeline {
    let mut builder = PipelineBuilder::new(capacity)
        .failure_policy(policy)
        .runner(ModelKind::Declarative, runner.clone())
        .runner(ModelKind::Procedural, runner.clone());
    if let Some(store) = store {
        builder = builder.metadata_store(store);
    }
    builder.register_all(models).expect("models register");
    builder.build().expect("pipeline builds")
}

fn position(order: &[String], model: &str) -> usize {
    order
        .iter()
        .position(|m| m == model)
        .unwrap_or_else(|| panic!("{model} was not executed; order = {order:?}"))
}

/// A -> B -> C, and C also depends on D.
fn diamond_tail() -> Vec<Model> {
    vec![
        ModelBuilder::new("A").memory_gb(4).build(),
        ModelBuilder::new("B").memory_gb(4).after(&["A"]).build(),
        ModelBuilder::new("C").memory_gb(8).after(&["B", "D"]).build(),
        ModelBuilder::new("D").memory_gb(4).build(),
    ]
}

#[tokio::test]
async fn chain_runs_in_dependency_order_and_plans_groups() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new()
        .default_delay(Duration::from_millis(10))
        .into_arc();
    let pipeline = build(
        ResourceVector::gb(8, 4, 0),
        FailurePolicy::FailFast,
        &runner,
        None,
        diamond_tail(),
    );

    let levels: Vec<Vec<&str>> = pipeline
        .graph()
        .levels()
        .iter()
        .map(|l| l.iter().map(String::as_str).collect())
        .collect();
    assert_eq!(levels, vec![vec!["A", "D"], vec!["B"], vec!["C"]]);

    let plan = pipeline.plan();
    let groups: Vec<Vec<Vec<&str>>> = plan
        .levels()
        .iter()
        .map(|l| {
            l.groups
                .iter()
                .map(|g| g.models.iter().map(String::as_str).collect())
                .collect()
        })
        .collect();
    assert_eq!(
        groups,
        vec![vec![vec!["A", "D"]], vec![vec!["B"]], vec![vec!["C"]]]
    );

    let report = with_timeout(pipeline.run()).await?;
    assert!(report.all_succeeded(), "report:\n{report}");
    assert_eq!(report.models.len(), 4);

    let order = runner.executed();
    assert!(position(&order, "A") < position(&order, "B"));
    assert!(position(&order, "B") < position(&order, "C"));
    assert!(position(&order, "D") < position(&order, "C"));

    // A and D share the pool; C needs all of it.
    assert_eq!(runner.peak_concurrency(), 2);
    assert_eq!(report.peak_allocation().memory_mb, 8 * 1024);
    Ok(())
}

#[tokio::test]
async fn fail_fast_skips_dependents_only() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new().fail("A", "boom").into_arc();
    let pipeline = build(
        ResourceVector::gb(16, 8, 0),
        FailurePolicy::FailFast,
        &runner,
        None,
        diamond_tail(),
    );

    let report = with_timeout(pipeline.run()).await?;

    assert_eq!(report.status_of("A"), Some(ExecutionStatus::Failed));
    assert_eq!(report.get("A").and_then(|m| m.error.as_deref()), Some("boom"));
    assert_eq!(report.status_of("D"), Some(ExecutionStatus::Succeeded));

    let b = report.get("B").expect("B reported");
    assert_eq!(b.status, ExecutionStatus::Skipped);
    assert_eq!(b.error.as_deref(), Some("skipped due to A"));

    let c = report.get("C").expect("C reported");
    assert_eq!(c.status, ExecutionStatus::Skipped);
    assert_eq!(c.skip_cause.as_ref().map(|s| s.root.as_str()), Some("A"));
    assert_eq!(c.error.as_deref(), Some("skipped due to A (via A -> B)"));

    assert!(!runner.was_executed("B"));
    assert!(!runner.was_executed("C"));
    assert!(!report.all_succeeded());
    Ok(())
}

#[tokio::test]
async fn degrade_submits_dependents_which_fail_validation() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new().fail("A", "boom").into_arc();
    let pipeline = build(
        ResourceVector::gb(16, 8, 0),
        FailurePolicy::Degrade,
        &runner,
        None,
        diamond_tail(),
    );

    let report = with_timeout(pipeline.run()).await?;

    assert_eq!(report.status_of("D"), Some(ExecutionStatus::Succeeded));
    for model in ["B", "C"] {
        let m = report.get(model).expect("reported");
        assert_eq!(m.status, ExecutionStatus::Failed, "{model}");
        assert!(m.skip_cause.is_none());
        let error = m.error.as_deref().unwrap_or_default();
        assert!(error.contains("not ready"), "{model}: {error}");
        assert!(!runner.was_executed(model));
    }
    let b_error = report.get("B").and_then(|m| m.error.clone()).unwrap_or_default();
    assert!(b_error.contains("A: last run failed"), "{b_error}");
    Ok(())
}

#[tokio::test]
async fn oversized_model_is_rejected_without_queueing() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new().into_arc();
    let pipeline = build(
        ResourceVector::gb(16, 8, 0),
        FailurePolicy::FailFast,
        &runner,
        None,
        vec![
            ModelBuilder::new("huge").memory_gb(20).build(),
            ModelBuilder::new("after_huge").after(&["huge"]).build(),
            ModelBuilder::new("small").build(),
        ],
    );

    assert_eq!(pipeline.plan().oversized_models(), vec!["huge"]);

    let report = with_timeout(pipeline.run()).await?;
    let huge = report.get("huge").expect("reported");
    assert_eq!(huge.status, ExecutionStatus::Failed);
    assert!(huge.started_at.is_none());
    let error = huge.error.as_deref().unwrap_or_default();
    assert!(error.contains("20480MB/1cpu/0gpu"), "{error}");
    assert!(error.contains("16384MB/8cpu/0gpu"), "{error}");

    assert_eq!(report.status_of("after_huge"), Some(ExecutionStatus::Skipped));
    assert_eq!(report.status_of("small"), Some(ExecutionStatus::Succeeded));
    assert!(!runner.was_executed("huge"));
    assert!(pipeline.scheduler().pending().is_empty());

    let err = pipeline
        .scheduler()
        .schedule("huge", ResourceVector::gb(20, 1, 0), 0)
        .err()
        .expect("still rejected");
    assert!(matches!(err, ModeldagError::ResourceExceeded { .. }));
    Ok(())
}

#[tokio::test]
async fn execution_timeout_fails_and_cancels_the_runner() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new().hang("slow").into_arc();
    let pipeline = build(
        ResourceVector::gb(16, 8, 0),
        FailurePolicy::FailFast,
        &runner,
        None,
        vec![
            ModelBuilder::new("slow")
                .max_execution_time(Duration::from_millis(100))
                .build(),
            ModelBuilder::new("downstream").after(&["slow"]).build(),
        ],
    );

    let report = with_timeout(pipeline.run()).await?;

    let slow = report.get("slow").expect("reported");
    assert_eq!(slow.status, ExecutionStatus::Failed);
    let error = slow.error.as_deref().unwrap_or_default();
    assert!(error.contains("exceeded its maximum execution time"), "{error}");
    assert_eq!(report.status_of("downstream"), Some(ExecutionStatus::Skipped));

    assert!(pipeline.scheduler().allocated().is_zero());
    assert_eq!(runner.running(), 0);

    // The runner is told to stop after the outcome is recorded.
    with_timeout(async {
        while runner.cancel_requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(runner.cancel_requests(), vec!["slow".to_string()]);
    Ok(())
}

/// Never finishes and never acknowledges a cancellation.
#[derive(Debug, Default)]
struct UnresponsiveRunner;

impl Runner for UnresponsiveRunner {
    fn execute(
        &self,
        _ctx: RunContext,
    ) -> Pin<Box<dyn Future<Output = modeldag::errors::Result<RunOutcome>> + Send + '_>> {
        Box::pin(std::future::pending())
    }

    fn cancel(&self, _model: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(std::future::pending())
    }
}

#[tokio::test]
async fn timeout_releases_resources_without_waiting_for_the_runner() -> TestResult {
    init_tracing();

    let runner: Arc<dyn Runner> = Arc::new(UnresponsiveRunner);
    let mut builder = PipelineBuilder::new(ResourceVector::gb(4, 2, 0))
        .runner(ModelKind::Declarative, runner);
    builder.register_all([
        ModelBuilder::new("stuck")
            .memory_gb(4)
            .max_execution_time(Duration::from_millis(50))
            .build(),
        ModelBuilder::new("next")
            .memory_gb(4)
            .max_execution_time(Duration::from_millis(50))
            .build(),
    ])?;
    let pipeline = builder.build()?;

    let report = with_timeout(pipeline.run()).await?;

    assert_eq!(report.status_of("stuck"), Some(ExecutionStatus::Failed));
    assert_eq!(report.status_of("next"), Some(ExecutionStatus::Failed));
    assert!(pipeline.scheduler().allocated().is_zero());
    Ok(())
}

#[tokio::test]
async fn allocations_never_exceed_capacity() -> TestResult {
    init_tracing();

    let capacity = ResourceVector::gb(10, 4, 1);
    let mut models = Vec::new();
    for i in 0..12u64 {
        let mut b = ModelBuilder::new(&format!("m{i:02}"))
            .memory_gb(1 + i % 4)
            .cpu_cores(1 + (i % 2) as u32);
        if i % 5 == 0 {
            b = b.gpus(1);
        }
        if i >= 6 {
            let upstream = format!("m{:02}", i - 6);
            b = b.after(&[upstream.as_str()]);
        }
        models.push(b.build());
    }

    let runner = FakeRunner::new()
        .default_delay(Duration::from_millis(15))
        .into_arc();
    let pipeline = build(capacity, FailurePolicy::FailFast, &runner, None, models);

    let report = with_timeout(pipeline.run()).await?;
    assert!(report.all_succeeded(), "report:\n{report}");

    assert!(!report.utilization.is_empty());
    for sample in &report.utilization {
        assert!(
            sample.allocated.fits_within(&capacity),
            "{} exceeds {}",
            sample.allocated,
            capacity
        );
    }
    assert!(report.peak_running() > 1);
    assert!(report.peak_allocation().fits_within(&capacity));
    assert!(pipeline.scheduler().allocated().is_zero());
    Ok(())
}

#[tokio::test]
async fn higher_priority_is_admitted_first_when_capacity_frees() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new()
        .delay("a_blocker", Duration::from_millis(50))
        .into_arc();
    let pipeline = build(
        ResourceVector::gb(4, 2, 0),
        FailurePolicy::FailFast,
        &runner,
        None,
        vec![
            ModelBuilder::new("a_blocker").memory_gb(4).build(),
            ModelBuilder::new("b_low").memory_gb(4).priority(1).build(),
            ModelBuilder::new("c_high").memory_gb(4).priority(10).build(),
        ],
    );

    let report = with_timeout(pipeline.run()).await?;
    assert!(report.all_succeeded(), "report:\n{report}");
    assert_eq!(runner.executed(), vec!["a_blocker", "c_high", "b_low"]);
    assert_eq!(runner.peak_concurrency(), 1);
    Ok(())
}

#[tokio::test]
async fn selection_validates_upstream_from_history() -> TestResult {
    init_tracing();

    let store = Arc::new(MemoryMetadataStore::new());
    store.seed(
        "raw",
        RunSummary::succeeded(Utc::now() - chrono::Duration::minutes(90), 500),
    );

    let runner = FakeRunner::new().into_arc();
    let pipeline = build(
        ResourceVector::gb(16, 8, 0),
        FailurePolicy::FailFast,
        &runner,
        Some(store.clone()),
        vec![
            ModelBuilder::new("raw").build(),
            ModelBuilder::new("staged")
                .after(&["raw"])
                .staleness_minutes(60)
                .build(),
            ModelBuilder::new("mart").after(&["staged"]).build(),
        ],
    );

    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = failures.clone();
        pipeline
            .events()
            .subscribe(EventKind::DependencyFailed, move |event: &ModelEvent| {
                if let ModelEvent::DependencyFailed {
                    model,
                    dependency,
                    reason,
                    ..
                } = event
                {
                    failures
                        .lock()
                        .unwrap()
                        .push((model.clone(), dependency.clone(), reason.clone()));
                }
                Ok(())
            });
    }

    let report = with_timeout(pipeline.run_selected(&["staged".to_string()])).await?;

    // `raw` is upstream of the selection: never executed, never reported.
    assert!(report.get("raw").is_none());
    assert!(!runner.was_executed("raw"));

    let staged = report.get("staged").expect("reported");
    assert_eq!(staged.status, ExecutionStatus::Failed);
    let error = staged.error.as_deref().unwrap_or_default();
    assert!(
        error.contains("raw: stale (last success 90m ago, threshold 1h)"),
        "{error}"
    );
    assert_eq!(report.status_of("mart"), Some(ExecutionStatus::Skipped));

    let failures = failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "staged");
    assert_eq!(failures[0].1, "raw");
    assert!(failures[0].2.starts_with("stale"));

    // Fresh history makes the same selection runnable.
    store.seed("raw", RunSummary::succeeded(Utc::now(), 500));
    let rerun = build(
        ResourceVector::gb(16, 8, 0),
        FailurePolicy::FailFast,
        &runner,
        Some(store.clone()),
        vec![
            ModelBuilder::new("raw").build(),
            ModelBuilder::new("staged")
                .after(&["raw"])
                .staleness_minutes(60)
                .build(),
            ModelBuilder::new("mart").after(&["staged"]).build(),
        ],
    );
    let fresh = with_timeout(rerun.run_selected(&["staged".to_string()])).await?;
    assert_eq!(fresh.status_of("staged"), Some(ExecutionStatus::Succeeded));
    assert_eq!(fresh.status_of("mart"), Some(ExecutionStatus::Succeeded));
    Ok(())
}

#[tokio::test]
async fn cancelling_a_running_model_skips_its_dependents() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new().hang("A").into_arc();
    let pipeline = build(
        ResourceVector::gb(16, 8, 0),
        FailurePolicy::FailFast,
        &runner,
        None,
        vec![
            ModelBuilder::new("A").build(),
            ModelBuilder::new("B").after(&["A"]).build(),
        ],
    );
    let controller = pipeline.controller();

    let cancel = async {
        while runner.running() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controller.cancel("A").await
    };

    let (report, outcome) = with_timeout(async { tokio::join!(pipeline.run(), cancel) }).await;
    let report = report?;

    assert_eq!(outcome?, CancelOutcome::Cancelling);
    assert_eq!(report.status_of("A"), Some(ExecutionStatus::Cancelled));
    let b = report.get("B").expect("reported");
    assert_eq!(b.status, ExecutionStatus::Skipped);
    assert_eq!(b.error.as_deref(), Some("skipped due to A"));
    Ok(())
}

#[tokio::test]
async fn lifecycle_events_are_published_in_order() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new().into_arc();
    let pipeline = build(
        ResourceVector::gb(16, 8, 0),
        FailurePolicy::FailFast,
        &runner,
        None,
        vec![
            ModelBuilder::new("A").build(),
            ModelBuilder::new("B").after(&["A"]).build(),
        ],
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        pipeline.events().subscribe_all(move |event: &ModelEvent| {
            if event.model() == "B" {
                seen.lock().unwrap().push(event.kind());
            }
            Ok(())
        });
    }

    let report = with_timeout(pipeline.run()).await?;
    assert!(report.all_succeeded());

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            EventKind::DependencyReady,
            EventKind::ModelStarted,
            EventKind::ModelCompleted
        ]
    );
    Ok(())
}

#[tokio::test]
async fn cancel_all_stops_queued_and_running_models() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new().hang("A").hang("C").into_arc();
    let pipeline = build(
        ResourceVector::gb(4, 8, 0),
        FailurePolicy::FailFast,
        &runner,
        None,
        vec![
            ModelBuilder::new("A").memory_gb(4).priority(10).build(),
            ModelBuilder::new("B").after(&["A"]).build(),
            ModelBuilder::new("C").memory_gb(4).build(),
        ],
    );
    let controller = pipeline.controller();

    let cancel = async {
        while runner.running() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controller.cancel_all().await
    };

    let (report, outcomes) = with_timeout(async { tokio::join!(pipeline.run(), cancel) }).await;
    let report = report?;

    assert_eq!(
        outcomes,
        vec![
            ("A".to_string(), CancelOutcome::Cancelling),
            ("C".to_string(), CancelOutcome::Cancelled),
        ]
    );
    assert!(controller.is_halted());
    assert_eq!(report.status_of("A"), Some(ExecutionStatus::Cancelled));
    assert_eq!(report.status_of("C"), Some(ExecutionStatus::Cancelled));
    assert_eq!(report.status_of("B"), Some(ExecutionStatus::Skipped));
    assert_eq!(runner.executed(), vec!["A".to_string()]);
    assert!(pipeline.scheduler().allocated().is_zero());
    Ok(())
}

#[tokio::test]
async fn halted_run_cancels_later_submissions() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new().into_arc();
    let pipeline = build(
        ResourceVector::gb(16, 8, 0),
        FailurePolicy::FailFast,
        &runner,
        None,
        vec![
            ModelBuilder::new("A").build(),
            ModelBuilder::new("B").after(&["A"]).build(),
            ModelBuilder::new("C").after(&["B"]).build(),
        ],
    );

    let controller = pipeline.controller();
    pipeline
        .events()
        .subscribe(EventKind::ModelCompleted, move |event: &ModelEvent| {
            if event.model() == "A" {
                controller.halt();
            }
            Ok(())
        });

    let report = with_timeout(pipeline.run()).await?;

    assert_eq!(report.status_of("A"), Some(ExecutionStatus::Succeeded));
    assert_eq!(report.status_of("B"), Some(ExecutionStatus::Cancelled));
    let c = report.get("C").expect("reported");
    assert_eq!(c.status, ExecutionStatus::Skipped);
    assert_eq!(c.error.as_deref(), Some("skipped due to B"));
    assert_eq!(runner.executed(), vec!["A".to_string()]);
    assert!(pipeline.controller().is_halted());
    Ok(())
}

/// Serves each model's history once, then claims it never ran.
#[derive(Debug, Default)]
struct ForgetfulStore {
    inner: MemoryMetadataStore,
    reads: Mutex<HashMap<String, usize>>,
}

impl MetadataStore for ForgetfulStore {
    fn last_run(&self, model: &str) -> anyhow::Result<Option<RunSummary>> {
        let mut reads = self.reads.lock().unwrap();
        let count = reads.entry(model.to_string()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Ok(None);
        }
        drop(reads);
        self.inner.last_run(model)
    }

    fn record_run(&self, model: &str, record: &ExecutionRecord) -> anyhow::Result<()> {
        self.inner.record_run(model, record)
    }
}

#[tokio::test]
async fn model_held_back_by_the_gate_fails_once_nothing_runs() -> TestResult {
    init_tracing();

    let runner = FakeRunner::new().into_arc();
    let store = Arc::new(ForgetfulStore::default());
    let mut builder = PipelineBuilder::new(ResourceVector::gb(16, 8, 0))
        .metadata_cache_ttl(Duration::ZERO)
        .metadata_store(store)
        .runner(ModelKind::Declarative, runner.clone());
    builder.register_all([
        ModelBuilder::new("up").build(),
        ModelBuilder::new("down").after(&["up"]).build(),
    ])?;
    let pipeline = builder.build()?;

    let report = with_timeout(pipeline.run()).await?;

    assert_eq!(report.status_of("up"), Some(ExecutionStatus::Succeeded));
    let down = report.get("down").expect("reported");
    assert_eq!(down.status, ExecutionStatus::Failed);
    let error = down.error.as_deref().unwrap_or_default();
    assert!(error.contains("up: never run"), "{error}");
    assert!(!runner.was_executed("down"));
    assert!(pipeline.scheduler().pending().is_empty());
    Ok(())
}
