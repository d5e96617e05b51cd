//! Scenario harness: runs the queue end to end against a scripted engine.
//!
//! Each scenario builds its own queue, drives one lifecycle path, and
//! reports pass/fail with a message. The doubles here ([`ScriptedEngine`],
//! [`CompletionObserver`], [`CollectingSink`]) are public so integration
//! tests can reuse them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout;
use tracing::{error, info};

use crate::clock::{Clock, ManualClock, SystemClock};
use crate::engine::{ExecutionEngine, RunReport, RunRequest};
use crate::error::{AttemptFailure, SinkError};
use crate::notify::{LongRunNotice, LongRunNotifier, ProgressSink};
use crate::queue::{
    CancelOutcome, CancellationRegistry, Job, JobStatus, QueueConfig, RunObserver, RunQueue,
};
use crate::settings::LongRunNotifyConfig;

/// Hard ceiling per scenario; a hang counts as a failure, not a stall.
const SCENARIO_TIMEOUT: Duration = Duration::from_secs(10);
/// Ceiling for individual waits inside a scenario, kept below the
/// scenario ceiling so the more specific message wins.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Test doubles ─────────────────────────────────────────────────────────

/// One scripted engine outcome, consumed per attempt in order.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Succeed(String),
    Fail(String),
}

impl ScriptStep {
    pub fn succeed(output: impl Into<String>) -> Self {
        Self::Succeed(output.into())
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail(reason.into())
    }
}

/// Engine double that plays back scripted attempt outcomes.
///
/// The gated variant blocks every attempt until released and announces
/// each attempt on a channel the moment it enters the engine, so callers
/// can act while a run is provably in flight.
pub struct ScriptedEngine {
    script: Mutex<VecDeque<ScriptStep>>,
    gate: Option<Arc<Notify>>,
    attempts_tx: Option<mpsc::UnboundedSender<RunRequest>>,
    calls: AtomicU32,
}

impl ScriptedEngine {
    pub fn scripted(steps: impl IntoIterator<Item = ScriptStep>) -> Arc<Self> {
        Arc::new(Self::build(steps, None, None))
    }

    /// Returns the engine, the release handle, and the attempt feed.
    pub fn gated(
        steps: impl IntoIterator<Item = ScriptStep>,
    ) -> (Arc<Self>, Arc<Notify>, mpsc::UnboundedReceiver<RunRequest>) {
        let release = Arc::new(Notify::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self::build(steps, Some(Arc::clone(&release)), Some(tx));
        (Arc::new(engine), release, rx)
    }

    fn build(
        steps: impl IntoIterator<Item = ScriptStep>,
        gate: Option<Arc<Notify>>,
        attempts_tx: Option<mpsc::UnboundedSender<RunRequest>>,
    ) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            gate,
            attempts_tx,
            calls: AtomicU32::new(0),
        }
    }

    /// Engine invocations so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn run_attempt(&self, request: &RunRequest) -> Result<RunReport, AttemptFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.attempts_tx {
            let _ = tx.send(request.clone());
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let step = self.script.lock().await.pop_front();
        match step {
            Some(ScriptStep::Succeed(output)) => Ok(RunReport::with_output(output)),
            Some(ScriptStep::Fail(reason)) => Err(AttemptFailure::new(reason)),
            None => Err(AttemptFailure::new("script exhausted")),
        }
    }
}

/// Observer that forwards terminal job snapshots over a channel.
pub struct CompletionObserver {
    finished: mpsc::UnboundedSender<Job>,
}

impl CompletionObserver {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { finished: tx }), rx)
    }
}

#[async_trait]
impl RunObserver for CompletionObserver {
    async fn job_started(&self, _job: &Job) {}

    async fn job_finished(&self, job: &Job) {
        let _ = self.finished.send(job.clone());
    }
}

/// Sink that stores every notice it is handed.
#[derive(Default)]
pub struct CollectingSink {
    notices: Mutex<Vec<LongRunNotice>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn notices(&self) -> Vec<LongRunNotice> {
        self.notices.lock().await.clone()
    }
}

#[async_trait]
impl ProgressSink for CollectingSink {
    async fn deliver(&self, notice: &LongRunNotice) -> Result<(), SinkError> {
        self.notices.lock().await.push(notice.clone());
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HarnessReport {
    pub scenarios: Vec<ScenarioReport>,
}

impl HarnessReport {
    pub fn success(&self) -> bool {
        self.scenarios.iter().all(|scenario| scenario.success)
    }
}

/// Runs every scenario in order and collects the verdicts.
pub async fn run_queue_harness() -> HarnessReport {
    let scenarios: Vec<(&'static str, BoxFuture<'static, Result<(), String>>)> = vec![
        ("submit-and-succeed", submit_and_succeed().boxed()),
        ("cancel-while-queued", cancel_while_queued().boxed()),
        ("cancel-while-running", cancel_while_running().boxed()),
        ("retry-exhaustion", retry_exhaustion().boxed()),
        ("long-run-notifications", long_run_notifications().boxed()),
    ];

    let mut reports = Vec::with_capacity(scenarios.len());
    for (name, scenario) in scenarios {
        let outcome = match timeout(SCENARIO_TIMEOUT, scenario).await {
            Ok(result) => result,
            Err(_) => Err(format!("scenario still running after {SCENARIO_TIMEOUT:?}")),
        };
        match outcome {
            Ok(()) => {
                info!(scenario = name, "Scenario passed");
                reports.push(ScenarioReport {
                    name,
                    success: true,
                    message: None,
                });
            }
            Err(message) => {
                error!(scenario = name, message = %message, "Scenario failed");
                reports.push(ScenarioReport {
                    name,
                    success: false,
                    message: Some(message),
                });
            }
        }
    }
    HarnessReport { scenarios: reports }
}

// ── Scenarios ────────────────────────────────────────────────────────────

fn ensure(condition: bool, message: impl Into<String>) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message.into())
    }
}

async fn recv_finished(finished: &mut mpsc::UnboundedReceiver<Job>) -> Result<Job, String> {
    match timeout(WAIT_TIMEOUT, finished.recv()).await {
        Ok(Some(job)) => Ok(job),
        Ok(None) => Err("lifecycle channel closed early".to_string()),
        Err(_) => Err("timed out waiting for the job to finish".to_string()),
    }
}

async fn recv_attempt(
    attempts: &mut mpsc::UnboundedReceiver<RunRequest>,
) -> Result<RunRequest, String> {
    match timeout(WAIT_TIMEOUT, attempts.recv()).await {
        Ok(Some(request)) => Ok(request),
        Ok(None) => Err("attempt channel closed early".to_string()),
        Err(_) => Err("job never reached the engine".to_string()),
    }
}

fn scenario_queue(
    engine: Arc<dyn ExecutionEngine>,
    max_attempts: u32,
) -> (Arc<RunQueue>, mpsc::UnboundedReceiver<Job>) {
    let (observer, finished) = CompletionObserver::channel();
    let queue = RunQueue::new(
        QueueConfig { max_attempts },
        engine,
        Arc::new(CancellationRegistry::new()),
        Arc::new(SystemClock),
        vec![observer as Arc<dyn RunObserver>],
    );
    (queue, finished)
}

async fn submit_and_succeed() -> Result<(), String> {
    let engine = ScriptedEngine::scripted([ScriptStep::succeed("patch applied")]);
    let (queue, mut finished) = scenario_queue(engine, 3);
    queue.spawn_dispatch_loop();

    let queue_id = queue.submit("tasks/add-endpoint.md", "user-7").await;
    let job = recv_finished(&mut finished).await?;

    ensure(job.queue_id == queue_id, "finished a different job")?;
    ensure(
        job.status == JobStatus::Succeeded,
        format!("expected succeeded, got {}", job.status),
    )?;
    ensure(
        job.attempts == 1,
        format!("expected one attempt, got {}", job.attempts),
    )?;
    ensure(job.run_id.is_some(), "run id missing after dispatch")?;
    ensure(
        job.result.as_ref().and_then(|report| report.output.as_deref()) == Some("patch applied"),
        "run report did not carry the engine output",
    )
}

async fn cancel_while_queued() -> Result<(), String> {
    // Dispatch is deliberately not running, so the job stays queued.
    let engine = ScriptedEngine::scripted([]);
    let (queue, mut finished) = scenario_queue(engine, 3);
    let queue_id = queue.submit("tasks/refactor-auth.md", "user-7").await;

    let outcome = queue.cancel(queue_id).await.map_err(|err| err.to_string())?;
    let job = match outcome {
        CancelOutcome::Cancelled(job) => job,
        other => return Err(format!("expected an immediate cancel, got {other:?}")),
    };
    ensure(
        job.status == JobStatus::Cancelled,
        format!("expected cancelled, got {}", job.status),
    )?;
    ensure(job.attempts == 0, "a queued job must never reach the engine")?;
    ensure(job.run_id.is_none(), "a queued job must never get a run id")?;

    let observed = recv_finished(&mut finished).await?;
    ensure(observed.queue_id == queue_id, "observer saw a different job")?;

    let summary = queue.summary().await;
    ensure(
        summary.cancelled == 1 && summary.total == 1,
        format!("unexpected summary: {summary:?}"),
    )
}

async fn cancel_while_running() -> Result<(), String> {
    let (engine, release, mut attempts) =
        ScriptedEngine::gated([ScriptStep::fail("interrupted by operator")]);
    let (queue, mut finished) = scenario_queue(engine, 3);
    queue.spawn_dispatch_loop();

    let queue_id = queue.submit("tasks/migrate-db.md", "user-7").await;

    // Only cancel once the attempt is provably inside the engine.
    let request = recv_attempt(&mut attempts).await?;
    ensure(request.queue_id == queue_id, "engine saw a different job")?;

    let outcome = queue.cancel(queue_id).await.map_err(|err| err.to_string())?;
    ensure(
        matches!(outcome, CancelOutcome::Requested(_)),
        format!("expected a recorded request, got {outcome:?}"),
    )?;
    release.notify_one();

    let job = recv_finished(&mut finished).await?;
    ensure(
        job.status == JobStatus::Cancelled,
        format!("expected cancelled, got {}", job.status),
    )?;
    ensure(job.cancel_requested, "cancel flag lost on the way down")?;
    ensure(
        job.attempts == 1,
        format!("the in-flight attempt should count, got {}", job.attempts),
    )?;
    ensure(
        job.failure_reasons.len() == 1,
        "the failed attempt should leave one reason",
    )?;
    ensure(
        job.error.as_deref().is_some_and(|err| err.contains("cancelled")),
        format!("unexpected error text: {:?}", job.error),
    )
}

async fn retry_exhaustion() -> Result<(), String> {
    let engine = ScriptedEngine::scripted([
        ScriptStep::fail("tests failed on attempt one"),
        ScriptStep::fail("tests failed on attempt two"),
        ScriptStep::fail("tests failed on attempt three"),
    ]);
    let (queue, mut finished) = scenario_queue(Arc::clone(&engine) as Arc<dyn ExecutionEngine>, 3);
    queue.spawn_dispatch_loop();

    queue.submit("tasks/fix-flaky-test.md", "user-7").await;
    let job = recv_finished(&mut finished).await?;

    ensure(
        job.status == JobStatus::Failed,
        format!("expected failed, got {}", job.status),
    )?;
    ensure(
        job.attempts == 3 && job.max_attempts == 3,
        format!("expected 3 of 3 attempts, got {} of {}", job.attempts, job.max_attempts),
    )?;
    ensure(
        job.failure_reasons.len() == 3,
        format!("expected a full reason trail, got {:?}", job.failure_reasons),
    )?;
    ensure(
        job.failure_reasons[2] == "tests failed on attempt three",
        "reasons out of order",
    )?;
    ensure(
        job.error.as_deref().is_some_and(|err| err.contains("3 of 3")),
        format!("unexpected error text: {:?}", job.error),
    )?;
    ensure(engine.calls() == 3, "engine invocation count drifted")
}

async fn long_run_notifications() -> Result<(), String> {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let sink = CollectingSink::new();
    let notifier = LongRunNotifier::new(
        Arc::clone(&sink) as Arc<dyn ProgressSink>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        LongRunNotifyConfig {
            enabled: true,
            initial_delay: Duration::from_millis(5_000),
            interval: Some(Duration::from_millis(10_000)),
            max_notifications: Some(2),
        },
    );
    let (engine, release, mut attempts) =
        ScriptedEngine::gated([ScriptStep::succeed("long migration finished")]);
    let (completion, mut finished) = CompletionObserver::channel();
    let queue = RunQueue::new(
        QueueConfig { max_attempts: 3 },
        engine,
        Arc::new(CancellationRegistry::new()),
        Arc::clone(&clock) as Arc<dyn Clock>,
        vec![
            Arc::clone(&notifier) as Arc<dyn RunObserver>,
            completion as Arc<dyn RunObserver>,
        ],
    );
    queue.spawn_dispatch_loop();
    let queue_id = queue.submit("tasks/huge-migration.md", "user-7").await;

    // Hold the run inside the engine while the clock walks forward in
    // 5s steps; notices are due at +5s and +15s, capped at two.
    recv_attempt(&mut attempts).await?;
    let mut fired = Vec::new();
    for _ in 0..6 {
        clock.advance(Duration::from_millis(5_000));
        fired.push(notifier.fire_due().await);
    }
    ensure(
        fired == vec![1, 0, 1, 0, 0, 0],
        format!("unexpected notice pattern: {fired:?}"),
    )?;

    let notices = sink.notices().await;
    ensure(notices.len() == 2, format!("expected two notices, got {}", notices.len()))?;
    ensure(
        notices[0].elapsed == Duration::from_millis(5_000)
            && notices[1].elapsed == Duration::from_millis(15_000),
        "notice elapsed times drifted",
    )?;
    ensure(
        notices[0].queue_id == queue_id && notices[0].sequence == 1,
        "first notice misattributed",
    )?;

    release.notify_one();
    let job = recv_finished(&mut finished).await?;
    ensure(
        job.status == JobStatus::Succeeded,
        format!("expected succeeded, got {}", job.status),
    )?;
    ensure(
        notifier.tracked().await.is_empty(),
        "schedule should drop when the job finishes",
    )
}
