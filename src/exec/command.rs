// src/exec/command.rs

//! Shell command runner.
//!
//! Runs a model's `command` through the platform shell, reads the produced
//! row count from stdout and supports cancellation by killing the child.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::engine::RunOutcome;
use crate::errors::Result;
use crate::exec::runner::{RunContext, Runner};
use crate::types::ModelId;

/// Default pattern for the row count a command prints, e.g. `rows=1200`.
pub const DEFAULT_ROWS_PATTERN: &str = r"(?i)rows[=:]\s*(\d+)";

/// Extract the row count from captured stdout; the last match wins.
pub fn parse_row_count(stdout: &str, pattern: &Regex) -> Option<u64> {
    pattern
        .captures_iter(stdout)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().parse::<u64>().ok())
        .last()
}

type CancelMap = Arc<Mutex<HashMap<ModelId, oneshot::Sender<()>>>>;

#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    cancels: CancelMap,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands currently running.
    pub fn running(&self) -> usize {
        self.cancels.lock().len()
    }
}

impl Runner for CommandRunner {
    fn execute(
        &self,
        ctx: RunContext,
    ) -> Pin<Box<dyn Future<Output = Result<RunOutcome>> + Send + '_>> {
        let cancels = Arc::clone(&self.cancels);
        Box::pin(async move { Ok(run_command(ctx, cancels).await?) })
    }

    fn cancel(&self, model: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let sender = self.cancels.lock().remove(model);
        let model = model.to_string();
        Box::pin(async move {
            match sender {
                Some(tx) => {
                    debug!(model = %model, "forwarding cancellation to command");
                    tx.send(()).is_ok()
                }
                None => false,
            }
        })
    }
}

async fn run_command(ctx: RunContext, cancels: CancelMap) -> anyhow::Result<RunOutcome> {
    let Some(cmd_line) = ctx.command.as_deref() else {
        debug!(model = %ctx.model, "no command configured; nothing to run");
        return Ok(RunOutcome::succeeded(0));
    };

    let source = ctx.rows_pattern.as_deref().unwrap_or(DEFAULT_ROWS_PATTERN);
    let pattern = Regex::new(source)
        .with_context(|| format!("invalid rows_pattern for model '{}'", ctx.model))?;

    info!(model = %ctx.model, kind = %ctx.kind, cmd = %cmd_line, "starting model command");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd_line);
        c
    };
    cmd.env("MODELDAG_MODEL", &ctx.model)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning command for model '{}'", ctx.model))?;

    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    cancels.lock().insert(ctx.model.clone(), cancel_tx);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout of model '{}' was not captured", ctx.model))?;
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut captured = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            captured.push_str(&line);
            captured.push('\n');
        }
        captured
    });

    // Always drain stderr so the pipe never fills; keep the last line for
    // the failure message.
    let stderr_task = child.stderr.take().map(|stderr| {
        let model = ctx.model.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last = None;
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(model = %model, "stderr: {}", line);
                if !line.trim().is_empty() {
                    last = Some(line);
                }
            }
            last
        })
    });

    let outcome = tokio::select! {
        status = child.wait() => {
            let status = status
                .with_context(|| format!("waiting for command of model '{}'", ctx.model))?;
            let stdout = stdout_task.await.unwrap_or_default();
            let last_stderr = match stderr_task {
                Some(task) => task.await.ok().flatten(),
                None => None,
            };

            info!(
                model = %ctx.model,
                exit_code = status.code().unwrap_or(-1),
                success = status.success(),
                "model command exited"
            );

            if status.success() {
                RunOutcome::succeeded(parse_row_count(&stdout, &pattern).unwrap_or(0))
            } else {
                let code = status.code().unwrap_or(-1);
                let message = match last_stderr {
                    Some(line) => format!("command exited with code {code}: {line}"),
                    None => format!("command exited with code {code}"),
                };
                RunOutcome::failed(message)
            }
        }
        _ = &mut cancel_rx => {
            info!(model = %ctx.model, "cancellation requested; killing command");
            if let Err(err) = child.kill().await {
                warn!(model = %ctx.model, error = %err, "failed to kill command");
            }
            RunOutcome::cancelled()
        }
    };

    cancels.lock().remove(&ctx.model);
    Ok(outcome)
}
