// tests/integration/config_pipeline.rs

use std::io::Write;

use tempfile::NamedTempFile;

use modeldag::cli::CliArgs;
use modeldag::config::load_and_validate;
use modeldag::engine::{ExecutionStatus, ResourceVector};
use modeldag::types::FailurePolicy;
use modeldag_test_utils::{ConfigFileBuilder, ModelConfigBuilder, init_tracing, with_timeout};

const WAREHOUSE: &str = r#"
[config]
failure_policy = "fail-fast"
max_parallel_models = 2
metadata_cache_ttl = "5s"

[pool]
memory_mb = 8192
cpu_cores = 4

[model.stg_orders]
cmd = "echo rows=120"
memory_mb = 2048
cpu_cores = 1

[model.stg_users]
cmd = "echo 'loaded users' && echo rows=30"
memory_mb = 2048
cpu_cores = 1

[model.orders_by_user]
kind = "procedural"
cmd = "echo 'inserted 12 records'"
after = ["stg_orders", "stg_users"]
memory_mb = 4096
cpu_cores = 2
priority = 5
min_rows = 10
staleness = "60m"
max_execution_time = "30s"
rows_pattern = "inserted (\\d+) records"
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn args(path: &std::path::Path) -> CliArgs {
    CliArgs {
        config: path.display().to_string(),
        select: Vec::new(),
        policy: None,
        log_level: None,
        dry_run: false,
    }
}

#[test]
fn test_full_config_loads_with_defaults_applied() {
    let file = config_file(WAREHOUSE);
    let cfg = load_and_validate(file.path()).unwrap();

    assert_eq!(cfg.pool, ResourceVector::gb(8, 4, 0));
    assert_eq!(cfg.config.max_parallel_models, 2);

    let models = cfg.to_models().unwrap();
    let report = models.iter().find(|m| m.id == "orders_by_user").unwrap();
    assert_eq!(report.priority, 5);
    assert_eq!(report.min_rows, 10);
    assert_eq!(report.dependencies.len(), 2);
}

#[test]
fn test_dry_run_builds_without_executing() {
    let file = config_file(WAREHOUSE);
    let cfg = load_and_validate(file.path()).unwrap();
    let pipeline = modeldag::build_pipeline(&cfg, FailurePolicy::FailFast).unwrap();

    let plan = pipeline.plan();
    assert_eq!(plan.levels().len(), 2);
    assert_eq!(plan.levels()[0].groups.len(), 1);
    assert!(plan.oversized_models().is_empty());
    assert!(plan.to_string().contains("stg_orders, stg_users"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_config_driven_run_parses_row_counts() {
    init_tracing();

    let file = config_file(WAREHOUSE);
    let cfg = load_and_validate(file.path()).unwrap();
    let pipeline = modeldag::build_pipeline(&cfg, cfg.config.failure_policy).unwrap();

    let report = with_timeout(pipeline.run()).await.unwrap();
    assert!(report.all_succeeded(), "report:\n{report}");
    assert_eq!(report.get("stg_orders").unwrap().row_count, Some(120));
    assert_eq!(report.get("stg_users").unwrap().row_count, Some(30));
    assert_eq!(report.get("orders_by_user").unwrap().row_count, Some(12));
}

#[cfg(unix)]
#[tokio::test]
async fn test_min_rows_blocks_downstream_model() {
    init_tracing();

    let cfg = ConfigFileBuilder::new()
        .with_pool(ResourceVector::gb(4, 2, 0))
        .with_policy(FailurePolicy::Degrade)
        .with_model("thin", ModelConfigBuilder::new().cmd("echo rows=2").build())
        .with_model(
            "needs_more",
            ModelConfigBuilder::new()
                .cmd("echo rows=1")
                .after("thin")
                .min_rows(5)
                .build(),
        )
        .build();
    let pipeline = modeldag::build_pipeline(&cfg, cfg.config.failure_policy).unwrap();

    let report = with_timeout(pipeline.run()).await.unwrap();
    assert_eq!(report.status_of("thin"), Some(ExecutionStatus::Succeeded));
    let blocked = report.get("needs_more").unwrap();
    assert_eq!(blocked.status, ExecutionStatus::Failed);
    assert!(
        blocked
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("thin: produced 2 rows, minimum is 5")
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_entry_point_reports_failures() {
    init_tracing();

    let file = config_file(
        r#"
[pool]
memory_mb = 1024
cpu_cores = 1

[model.ok]
cmd = "true"

[model.bad]
cmd = "exit 4"
after = ["ok"]
"#,
    );

    let mut dry = args(file.path());
    dry.dry_run = true;
    modeldag::run(dry).await.unwrap();

    let err = with_timeout(modeldag::run(args(file.path())))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("1 of 2 models did not succeed"), "{err}");
}
