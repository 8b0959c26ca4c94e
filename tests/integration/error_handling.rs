// tests/integration/error_handling.rs

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;

use modeldag::config::load_and_validate;
use modeldag::dag::Model;
use modeldag::engine::{CancelOutcome, ExecutionStatus, PipelineBuilder, ResourceVector};
use modeldag::errors::ModeldagError;
use modeldag::types::ModelKind;
use modeldag_test_utils::{FakeRunner, ModelBuilder, Script, init_tracing, with_timeout};

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn test_dag_cycle_returns_structured_error() {
    let file = config_file(
        r#"
[pool]
memory_mb = 4096
cpu_cores = 2

[model.A]
after = ["B"]

[model.B]
after = ["A"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(ModeldagError::Cycle { model, members }) => {
            assert!(model == "A" || model == "B");
            assert!(members.contains(&"A".to_string()));
            assert!(members.contains(&"B".to_string()));
        }
        Err(e) => panic!("Expected Cycle error, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_unknown_dependency_is_named() {
    let file = config_file(
        r#"
[pool]
memory_mb = 4096
cpu_cores = 2

[model.A]
after = ["NonExistent"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(ModeldagError::UnknownDependency { model, dependency }) => {
            assert_eq!(model, "A");
            assert_eq!(dependency, "NonExistent");
        }
        Err(e) => panic!("Expected UnknownDependency, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_missing_file_and_bad_toml() {
    let err = load_and_validate("/definitely/not/here/Modeldag.toml").unwrap_err();
    assert!(matches!(err, ModeldagError::IoError(_)));

    let file = config_file("[model.A\ncmd = ");
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, ModeldagError::TomlError(_)));

    let file = config_file(
        "[config]\nfailure_policy = \"retry\"\n[pool]\nmemory_mb = 1\ncpu_cores = 1\n[model.A]\n",
    );
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, ModeldagError::TomlError(_)));
}

#[test]
fn test_registration_errors() {
    let runner = FakeRunner::new().into_arc();
    let mut builder =
        PipelineBuilder::new(ResourceVector::gb(4, 2, 0)).runner(ModelKind::Declarative, runner);

    builder.register(Model::declarative("A")).unwrap();
    let err = builder.register(Model::declarative("A")).unwrap_err();
    assert!(matches!(err, ModeldagError::DuplicateModel(ref id) if id == "A"));

    let err = builder.register(Model::procedural("train")).unwrap_err();
    assert!(matches!(
        err,
        ModeldagError::NoRunner { kind: ModelKind::Procedural, .. }
    ));

    builder
        .register(Model::declarative("B").depends_on("ghost"))
        .unwrap();
    let err = builder.build().err().unwrap();
    assert!(matches!(err, ModeldagError::UnknownDependency { .. }));
}

#[tokio::test]
async fn test_runtime_api_misuse_is_reported() {
    init_tracing();

    let runner = FakeRunner::new().into_arc();
    let mut builder = PipelineBuilder::new(ResourceVector::gb(4, 2, 0))
        .runner(ModelKind::Declarative, runner.clone());
    builder.register(ModelBuilder::new("A").build()).unwrap();
    let pipeline = builder.build().unwrap();

    let err = pipeline
        .run_selected(&["nope".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, ModeldagError::ModelNotFound(ref id) if id == "nope"));

    let err = pipeline.controller().cancel("A").await.unwrap_err();
    assert!(matches!(err, ModeldagError::NotInFlight(_)));

    let report = with_timeout(pipeline.run()).await.unwrap();
    assert!(report.all_succeeded());
    assert_eq!(
        pipeline.controller().cancel("A").await.unwrap(),
        CancelOutcome::AlreadyFinished(ExecutionStatus::Succeeded)
    );
}

#[tokio::test]
async fn test_runner_errors_are_recorded_verbatim() {
    init_tracing();

    let runner = Arc::new(
        FakeRunner::new().script("A", Script::Error("warehouse connection refused".into())),
    );
    let mut builder = PipelineBuilder::new(ResourceVector::gb(4, 2, 0))
        .runner(ModelKind::Declarative, runner.clone());
    builder
        .register_all([
            ModelBuilder::new("A").build(),
            ModelBuilder::new("B").after(&["A"]).build(),
        ])
        .unwrap();
    let pipeline = builder.build().unwrap();

    let report = with_timeout(pipeline.run()).await.unwrap();
    let a = report.get("A").unwrap();
    assert_eq!(a.status, ExecutionStatus::Failed);
    assert_eq!(a.error.as_deref(), Some("warehouse connection refused"));
    assert_eq!(report.status_of("B"), Some(ExecutionStatus::Skipped));
    assert!(pipeline.scheduler().allocated().is_zero());
}
