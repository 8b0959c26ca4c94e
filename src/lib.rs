// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
pub mod dag;
pub mod deps;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::{ExecutionStatus, Pipeline, PipelineBuilder};
use crate::exec::CommandRunner;
use crate::types::{FailurePolicy, ModelKind};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - pipeline construction with the command runner for both model kinds
/// - Ctrl-C handling (cancels every queued and running model)
/// - the end-of-run report on stdout
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;
    let policy = args.policy.unwrap_or(cfg.config.failure_policy);

    let pipeline = build_pipeline(&cfg, policy)?;

    if args.dry_run {
        print_dry_run(&pipeline);
        return Ok(());
    }

    // Ctrl-C → cancel everything still queued or running.
    {
        let controller = pipeline.controller();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            warn!("interrupt received; cancelling queued and running models");
            let cancelled = controller.cancel_all().await;
            debug!(count = cancelled.len(), "cancellation requests sent");
        });
    }

    let report = if args.select.is_empty() {
        pipeline.run().await?
    } else {
        info!(selection = ?args.select, "running selected models and their dependents");
        pipeline.run_selected(&args.select).await?
    };

    println!("{report}");

    if !report.all_succeeded() {
        let failed = report.with_status(ExecutionStatus::Failed).len();
        let skipped = report.with_status(ExecutionStatus::Skipped).len();
        let cancelled = report.with_status(ExecutionStatus::Cancelled).len();
        bail!(
            "{} of {} models did not succeed ({} failed, {} skipped, {} cancelled)",
            failed + skipped + cancelled,
            report.models.len(),
            failed,
            skipped,
            cancelled
        );
    }

    Ok(())
}

/// Build a pipeline for a validated config, running every model through
/// a shared [`CommandRunner`].
pub fn build_pipeline(cfg: &ConfigFile, policy: FailurePolicy) -> errors::Result<Pipeline> {
    let runner = Arc::new(CommandRunner::new());

    let mut builder = PipelineBuilder::new(cfg.pool)
        .failure_policy(policy)
        .max_parallel_models(cfg.config.max_parallel_models)
        .metadata_cache_ttl(cfg.metadata_cache_ttl()?)
        .runner(ModelKind::Declarative, runner.clone())
        .runner(ModelKind::Procedural, runner);

    builder.register_all(cfg.to_models()?)?;
    builder.build()
}

/// Dry-run output: topological levels followed by the packed plan.
fn print_dry_run(pipeline: &Pipeline) {
    println!("modeldag dry-run");
    println!("  failure_policy = {}", pipeline.policy());
    println!();

    println!("levels ({}):", pipeline.graph().levels().len());
    for (index, level) in pipeline.graph().levels().iter().enumerate() {
        println!("  {index}: {}", level.join(", "));
        for id in level {
            let Some(model) = pipeline.model(id) else {
                continue;
            };
            if let Some(cmd) = &model.command {
                println!("      {id} ({}, {}): {cmd}", model.kind, model.resources);
            } else {
                println!("      {id} ({}, {}): no command", model.kind, model.resources);
            }
        }
    }
    println!();
    print!("{}", pipeline.plan());

    debug!("dry-run complete (no execution)");
}
