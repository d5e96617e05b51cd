//! Queue ownership and the dispatch loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::{ExecutionEngine, RunRequest};
use crate::error::QueueError;
use crate::queue::cancel::CancellationRegistry;
use crate::queue::job::{Job, JobStatus};
use crate::queue::retry::{RetryExecutor, RunVerdict};

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Engine invocations allowed per job before it is marked failed.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

/// Observes job lifecycle transitions.
///
/// Callbacks run inside the dispatch path and must stay cheap; anything slow
/// belongs on the far side of a channel.
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn job_started(&self, job: &Job);
    async fn job_finished(&self, job: &Job);
}

/// Outcome of a cancel call.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The job was still queued and is now cancelled.
    Cancelled(Job),
    /// The job is running; the request was recorded and takes effect at the
    /// executor's next poll point.
    Requested(Job),
    /// The job had already finished; nothing changed.
    AlreadyTerminal(Job),
}

/// Per-status counts across every job the queue still remembers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<Job>,
    /// Jobs still waiting, in dispatch order.
    pub queued: Vec<Job>,
    /// Terminal jobs, most recently finished first.
    pub finished: Vec<Job>,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) jobs: HashMap<Uuid, Job>,
    pub(crate) pending: VecDeque<Uuid>,
    pub(crate) active: Option<Uuid>,
}

pub(crate) type SharedQueueState = Arc<Mutex<QueueState>>;

/// FIFO run queue with a single worker slot.
///
/// Owns every job record; collaborators (engine, cancellation registry,
/// clock, observers) are injected. Construct with [`RunQueue::new`], then
/// start [`RunQueue::spawn_dispatch_loop`] to begin executing jobs.
pub struct RunQueue {
    config: QueueConfig,
    state: SharedQueueState,
    executor: RetryExecutor,
    cancellations: Arc<CancellationRegistry>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn RunObserver>>,
    dispatch_wakeup: Notify,
}

impl RunQueue {
    pub fn new(
        config: QueueConfig,
        engine: Arc<dyn ExecutionEngine>,
        cancellations: Arc<CancellationRegistry>,
        clock: Arc<dyn Clock>,
        observers: Vec<Arc<dyn RunObserver>>,
    ) -> Arc<Self> {
        let state: SharedQueueState = Arc::new(Mutex::new(QueueState::default()));
        let executor =
            RetryExecutor::new(engine, Arc::clone(&cancellations), Arc::clone(&state));
        Arc::new(Self {
            config,
            state,
            executor,
            cancellations,
            clock,
            observers,
            dispatch_wakeup: Notify::new(),
        })
    }

    // ── Submission and reads ─────────────────────────────────────────────

    /// Appends a job to the dispatch line. Always succeeds.
    pub async fn submit(
        &self,
        payload: impl Into<String>,
        requester_id: impl Into<String>,
    ) -> Uuid {
        let job = Job::new(
            payload,
            requester_id,
            self.config.max_attempts,
            self.clock.now(),
        );
        let queue_id = job.queue_id;
        {
            let mut state = self.state.lock().await;
            state.jobs.insert(queue_id, job);
            state.pending.push_back(queue_id);
        }
        self.dispatch_wakeup.notify_one();
        info!(queue_id = %queue_id, "Job submitted");
        queue_id
    }

    /// Snapshot of one job.
    pub async fn status(&self, queue_id: Uuid) -> Result<Job, QueueError> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&queue_id)
            .cloned()
            .ok_or(QueueError::NotFound { queue_id })
    }

    /// Per-status counts, including terminal jobs not yet purged.
    pub async fn summary(&self) -> QueueSummary {
        let state = self.state.lock().await;
        let mut summary = QueueSummary {
            total: state.jobs.len(),
            ..QueueSummary::default()
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => summary.queued += 1,
                JobStatus::Running => summary.running += 1,
                JobStatus::Succeeded => summary.succeeded += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Active/pending/finished view of the whole queue.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let running = state.active.and_then(|id| state.jobs.get(&id).cloned());
        let queued = state
            .pending
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect();
        let mut finished: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.is_terminal())
            .cloned()
            .collect();
        finished.sort_by_key(|job| std::cmp::Reverse(job.finished_at));
        QueueSnapshot {
            running,
            queued,
            finished,
        }
    }

    /// Finds a job by the engine-facing run id.
    pub async fn find_by_run_id(&self, run_id: Uuid) -> Option<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .find(|job| job.run_id == Some(run_id))
            .cloned()
    }

    /// Drops terminal jobs from the table. Returns how many were removed.
    pub async fn purge_history(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| !job.is_terminal());
        let removed = before - state.jobs.len();
        if removed > 0 {
            info!(removed, "Purged finished jobs");
        }
        removed
    }

    // ── Cancellation ─────────────────────────────────────────────────────

    /// Cancels a job wherever it is in its lifecycle.
    ///
    /// Queued jobs are cancelled on the spot and leave the dispatch line;
    /// running jobs get a cancellation request honored at the executor's
    /// next poll point; finished jobs are left untouched.
    pub async fn cancel(&self, queue_id: Uuid) -> Result<CancelOutcome, QueueError> {
        let now = self.clock.now();
        let outcome = {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(&queue_id)
                .ok_or(QueueError::NotFound { queue_id })?;
            match job.status {
                JobStatus::Queued => {
                    job.cancel_requested = true;
                    job.transition_to(JobStatus::Cancelled, now)?;
                    job.error = Some("Cancelled before dispatch".to_string());
                    let snapshot = job.clone();
                    state.pending.retain(|id| id != &queue_id);
                    CancelOutcome::Cancelled(snapshot)
                }
                JobStatus::Running => {
                    job.cancel_requested = true;
                    let snapshot = job.clone();
                    // Register under the state lock so a concurrent finalize
                    // cannot clear the registry before the request lands.
                    self.cancellations.request_cancel(queue_id, now).await;
                    CancelOutcome::Requested(snapshot)
                }
                _ => CancelOutcome::AlreadyTerminal(job.clone()),
            }
        };

        match &outcome {
            CancelOutcome::Cancelled(job) => {
                info!(queue_id = %queue_id, "Queued job cancelled");
                self.notify_finished(job).await;
            }
            CancelOutcome::Requested(_) => {
                info!(queue_id = %queue_id, "Cancellation requested for running job");
            }
            CancelOutcome::AlreadyTerminal(job) => {
                debug!(queue_id = %queue_id, status = %job.status, "Cancel ignored, job already finished");
            }
        }
        Ok(outcome)
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    /// Starts the background task that feeds queued jobs through the
    /// engine, one at a time in submission order.
    pub fn spawn_dispatch_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            debug!("Dispatch loop started");
            loop {
                match queue.take_next().await {
                    Some(request) => queue.run_to_completion(request).await,
                    None => queue.dispatch_wakeup.notified().await,
                }
            }
        })
    }

    /// Pops the next queued job and marks it running, or `None` when the
    /// queue is idle or the worker slot is already taken.
    async fn take_next(&self) -> Option<RunRequest> {
        let (snapshot, run_id) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            // The worker slot is single width; never pop while a job runs.
            if state.active.is_some() {
                return None;
            }
            let mut dispatched = None;
            while let Some(queue_id) = state.pending.pop_front() {
                let Some(job) = state.jobs.get_mut(&queue_id) else {
                    continue;
                };
                if job.transition_to(JobStatus::Running, self.clock.now()).is_err() {
                    continue;
                }
                let run_id = Uuid::new_v4();
                job.run_id = Some(run_id);
                state.active = Some(queue_id);
                dispatched = Some((job.clone(), run_id));
                break;
            }
            dispatched
        }?;

        self.notify_started(&snapshot).await;
        info!(queue_id = %snapshot.queue_id, run_id = %run_id, "Job dispatched");
        Some(RunRequest {
            queue_id: snapshot.queue_id,
            run_id,
            attempt: 1,
            payload: snapshot.payload,
            requester_id: snapshot.requester_id,
        })
    }

    async fn run_to_completion(&self, request: RunRequest) {
        let verdict = self
            .executor
            .execute(&request, self.config.max_attempts)
            .await;
        self.finalize(&request, verdict).await;
    }

    /// Folds the verdict into the job's terminal state and frees the slot.
    async fn finalize(&self, request: &RunRequest, verdict: RunVerdict) {
        let now = self.clock.now();
        let finished = {
            let mut state = self.state.lock().await;
            state.active = None;
            let Some(job) = state.jobs.get_mut(&request.queue_id) else {
                warn!(queue_id = %request.queue_id, "Finished job vanished from the table");
                return;
            };
            let transition = match verdict {
                RunVerdict::Succeeded(report) => {
                    job.result = Some(report);
                    job.transition_to(JobStatus::Succeeded, now)
                }
                RunVerdict::Exhausted(exhausted) => {
                    job.error = Some(exhausted.to_string());
                    job.result = exhausted.last_report;
                    // A cancel that raced the verdict still decides the status.
                    let target = if job.cancel_requested {
                        JobStatus::Cancelled
                    } else {
                        JobStatus::Failed
                    };
                    job.transition_to(target, now)
                }
                RunVerdict::Cancelled(cancelled) => {
                    job.error = Some(cancelled.to_string());
                    job.transition_to(JobStatus::Cancelled, now)
                }
            };
            if let Err(err) = transition {
                warn!(queue_id = %request.queue_id, error = %err, "Job finished in an unexpected state");
            }
            job.clone()
        };

        self.cancellations.clear(request.queue_id).await;
        self.notify_finished(&finished).await;
        info!(
            queue_id = %finished.queue_id,
            status = %finished.status,
            attempts = finished.attempts,
            "Job finished"
        );
    }

    async fn notify_started(&self, job: &Job) {
        for observer in &self.observers {
            observer.job_started(job).await;
        }
    }

    async fn notify_finished(&self, job: &Job) {
        for observer in &self.observers {
            observer.job_finished(job).await;
        }
    }
}
