use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use modeldag::engine::RunOutcome;
use modeldag::errors::{ModeldagError, Result};
use modeldag::exec::{RunContext, Runner};
use modeldag::types::ModelId;

/// What the fake does when asked to execute a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Succeed with this many rows.
    Succeed(u64),
    /// Run, then report an unsuccessful outcome with this message.
    Fail(String),
    /// The runner itself errors.
    Error(String),
    /// Never finish on its own; only cancellation or a timeout ends it.
    HangUntilCancelled,
}

/// A runner that never spawns processes:
/// - outcomes and delays are scripted per model
/// - records which models were executed, in start order
/// - tracks how many executions overlap (concurrency probe)
/// - records every cancellation request it receives.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<ModelId, Script>>,
    delays: Mutex<HashMap<ModelId, Duration>>,
    default_delay: Mutex<Duration>,
    executed: Mutex<Vec<ModelId>>,
    cancel_requests: Mutex<Vec<ModelId>>,
    cancels: Mutex<HashMap<ModelId, oneshot::Sender<()>>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    /// Every model succeeds immediately with 100 rows unless scripted.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, model: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(model.to_string(), script);
        self
    }

    pub fn fail(self, model: &str, message: &str) -> Self {
        self.script(model, Script::Fail(message.to_string()))
    }

    pub fn rows(self, model: &str, rows: u64) -> Self {
        self.script(model, Script::Succeed(rows))
    }

    pub fn hang(self, model: &str) -> Self {
        self.script(model, Script::HangUntilCancelled)
    }

    pub fn delay(self, model: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(model.to_string(), delay);
        self
    }

    pub fn default_delay(self, delay: Duration) -> Self {
        *self.default_delay.lock().unwrap() = delay;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Models in the order their executions started.
    pub fn executed(&self) -> Vec<ModelId> {
        self.executed.lock().unwrap().clone()
    }

    pub fn was_executed(&self, model: &str) -> bool {
        self.executed.lock().unwrap().iter().any(|m| m == model)
    }

    pub fn cancel_requests(&self) -> Vec<ModelId> {
        self.cancel_requests.lock().unwrap().clone()
    }

    /// Executions in progress right now.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Most executions that were ever in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn script_for(&self, model: &str) -> (Script, Duration) {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(model)
            .cloned()
            .unwrap_or(Script::Succeed(100));
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(model)
            .copied()
            .unwrap_or(*self.default_delay.lock().unwrap());
        (script, delay)
    }
}

/// Keeps the counters right even when the execute future is dropped by a
/// timeout.
struct RunningGuard<'a> {
    runner: &'a FakeRunner,
    model: ModelId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.runner.cancels.lock().unwrap().remove(&self.model);
        self.runner.running.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn play(model: &str, script: Script, delay: Duration) -> Result<RunOutcome> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    match script {
        Script::Succeed(rows) => Ok(RunOutcome::succeeded(rows)),
        Script::Fail(message) => Ok(RunOutcome::failed(message)),
        Script::Error(message) => Err(ModeldagError::Runner {
            model: model.to_string(),
            message,
        }),
        Script::HangUntilCancelled => std::future::pending().await,
    }
}

impl Runner for FakeRunner {
    fn execute(
        &self,
        ctx: RunContext,
    ) -> Pin<Box<dyn Future<Output = Result<RunOutcome>> + Send + '_>> {
        Box::pin(async move {
            let (script, delay) = self.script_for(&ctx.model);
            let (tx, rx) = oneshot::channel();

            self.executed.lock().unwrap().push(ctx.model.clone());
            self.cancels.lock().unwrap().insert(ctx.model.clone(), tx);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard {
                runner: self,
                model: ctx.model.clone(),
            };

            tokio::select! {
                _ = rx => Ok(RunOutcome::cancelled()),
                result = play(&ctx.model, script, delay) => result,
            }
        })
    }

    fn cancel(&self, model: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        self.cancel_requests.lock().unwrap().push(model.to_string());
        let sender = self.cancels.lock().unwrap().remove(model);
        Box::pin(async move {
            match sender {
                Some(tx) => tx.send(()).is_ok(),
                None => false,
            }
        })
    }
}
