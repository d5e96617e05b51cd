//! Attempt loop for a single dispatched job.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{ExecutionEngine, RunReport, RunRequest};
use crate::error::{CancellationError, RetryExhaustedError};
use crate::queue::cancel::CancellationRegistry;
use crate::queue::manager::SharedQueueState;

/// Tagged outcome of running one job through its retry budget.
#[derive(Debug)]
pub enum RunVerdict {
    Succeeded(RunReport),
    Cancelled(CancellationError),
    Exhausted(RetryExhaustedError),
}

/// Runs one job against the engine until success, cancellation, or an empty
/// retry budget. Attempts are immediate; there is no backoff between them.
pub struct RetryExecutor {
    engine: Arc<dyn ExecutionEngine>,
    cancellations: Arc<CancellationRegistry>,
    state: SharedQueueState,
}

impl RetryExecutor {
    pub(crate) fn new(
        engine: Arc<dyn ExecutionEngine>,
        cancellations: Arc<CancellationRegistry>,
        state: SharedQueueState,
    ) -> Self {
        Self {
            engine,
            cancellations,
            state,
        }
    }

    /// Drives `request` through up to `max_attempts` engine invocations.
    ///
    /// Cancellation is polled before every attempt and again after every
    /// failed one, so a request that lands mid-attempt ends the run as
    /// cancelled even when that attempt was the last. Polls never count as
    /// attempts. Each completed attempt is mirrored onto the job record so
    /// status reads show the trail while the job is still running.
    pub async fn execute(&self, request: &RunRequest, max_attempts: u32) -> RunVerdict {
        let mut attempts: u32 = 0;
        let mut reasons: Vec<String> = Vec::new();
        let mut last_report: Option<RunReport> = None;

        loop {
            if self.cancellations.is_cancelled(request.queue_id).await {
                debug!(
                    queue_id = %request.queue_id,
                    attempts,
                    "Cancellation observed before attempt"
                );
                return RunVerdict::Cancelled(CancellationError::for_run(
                    request.queue_id,
                    Some(request.run_id),
                ));
            }

            let attempt_request = request.for_attempt(attempts + 1);
            match self.engine.run_attempt(&attempt_request).await {
                Ok(report) => {
                    attempts += 1;
                    self.record_attempt(request, None).await;
                    debug!(queue_id = %request.queue_id, attempts, "Attempt succeeded");
                    return RunVerdict::Succeeded(report);
                }
                Err(failure) => {
                    attempts += 1;
                    reasons.push(failure.reason.clone());
                    last_report = failure.report;
                    self.record_attempt(request, Some(&failure.reason)).await;
                    warn!(
                        queue_id = %request.queue_id,
                        run_id = %request.run_id,
                        attempt = attempts,
                        max_attempts,
                        reason = %failure.reason,
                        "Run attempt failed"
                    );
                    if self.cancellations.is_cancelled(request.queue_id).await {
                        debug!(
                            queue_id = %request.queue_id,
                            attempts,
                            "Cancellation observed after failed attempt"
                        );
                        return RunVerdict::Cancelled(CancellationError::for_run(
                            request.queue_id,
                            Some(request.run_id),
                        ));
                    }
                    if attempts >= max_attempts {
                        return RunVerdict::Exhausted(RetryExhaustedError {
                            attempts,
                            max_attempts,
                            reasons,
                            last_report,
                        });
                    }
                }
            }
        }
    }

    /// Mirrors the attempt onto the job record while it is still running.
    async fn record_attempt(&self, request: &RunRequest, reason: Option<&str>) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&request.queue_id) {
            job.attempts += 1;
            if let Some(reason) = reason {
                job.failure_reasons.push(reason.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use super::*;
    use crate::error::AttemptFailure;
    use crate::queue::job::Job;
    use crate::queue::manager::QueueState;

    struct ScriptEngine {
        outcomes: Mutex<VecDeque<Result<RunReport, AttemptFailure>>>,
        calls: AtomicU32,
    }

    impl ScriptEngine {
        fn new(outcomes: Vec<Result<RunReport, AttemptFailure>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExecutionEngine for ScriptEngine {
        async fn run_attempt(&self, _request: &RunRequest) -> Result<RunReport, AttemptFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(AttemptFailure::new("script exhausted")))
        }
    }

    /// Engine that asks for its own cancellation during the first attempt.
    struct SelfCancellingEngine {
        cancellations: Arc<CancellationRegistry>,
    }

    #[async_trait]
    impl ExecutionEngine for SelfCancellingEngine {
        async fn run_attempt(&self, request: &RunRequest) -> Result<RunReport, AttemptFailure> {
            self.cancellations
                .request_cancel(request.queue_id, Utc::now())
                .await;
            Err(AttemptFailure::new("interrupted"))
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            queue_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            attempt: 1,
            payload: "tasks/demo.md".to_string(),
            requester_id: "user-1".to_string(),
        }
    }

    fn state_with_job(request: &RunRequest) -> SharedQueueState {
        let mut job = Job::new(
            request.payload.clone(),
            request.requester_id.clone(),
            3,
            Utc::now(),
        );
        job.queue_id = request.queue_id;
        let mut state = QueueState::default();
        state.jobs.insert(request.queue_id, job);
        Arc::new(Mutex::new(state))
    }

    #[tokio::test]
    async fn first_attempt_success_needs_no_retry() {
        let request = request();
        let engine = ScriptEngine::new(vec![Ok(RunReport::with_output("done"))]);
        let executor = RetryExecutor::new(
            engine.clone(),
            Arc::new(CancellationRegistry::new()),
            state_with_job(&request),
        );

        let verdict = executor.execute(&request, 3).await;
        match verdict {
            RunVerdict::Succeeded(report) => assert_eq!(report.output.as_deref(), Some("done")),
            other => panic!("unexpected verdict: {other:?}"),
        }
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn failure_then_success_counts_both_attempts() {
        let request = request();
        let state = state_with_job(&request);
        let engine = ScriptEngine::new(vec![
            Err(AttemptFailure::new("sandbox timeout")),
            Ok(RunReport::default()),
        ]);
        let executor = RetryExecutor::new(
            engine.clone(),
            Arc::new(CancellationRegistry::new()),
            Arc::clone(&state),
        );

        let verdict = executor.execute(&request, 3).await;
        assert!(matches!(verdict, RunVerdict::Succeeded(_)));
        assert_eq!(engine.calls(), 2);

        let guard = state.lock().await;
        let job = guard.jobs.get(&request.queue_id).unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.failure_reasons, vec!["sandbox timeout".to_string()]);
    }

    #[tokio::test]
    async fn exhaustion_carries_the_full_reason_trail() {
        let request = request();
        let partial = RunReport::with_output("half-finished diff");
        let engine = ScriptEngine::new(vec![
            Err(AttemptFailure::new("connection reset")),
            Err(AttemptFailure::new("connection reset")),
            Err(AttemptFailure::with_report("workspace dirty", partial)),
        ]);
        let executor = RetryExecutor::new(
            engine.clone(),
            Arc::new(CancellationRegistry::new()),
            state_with_job(&request),
        );

        let verdict = executor.execute(&request, 3).await;
        match verdict {
            RunVerdict::Exhausted(err) => {
                assert_eq!(err.attempts, 3);
                assert_eq!(err.max_attempts, 3);
                assert_eq!(
                    err.reasons,
                    vec!["connection reset", "connection reset", "workspace dirty"]
                );
                assert_eq!(
                    err.last_report.and_then(|r| r.output),
                    Some("half-finished diff".to_string())
                );
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn pre_cancelled_job_never_reaches_the_engine() {
        let request = request();
        let cancellations = Arc::new(CancellationRegistry::new());
        cancellations
            .request_cancel(request.queue_id, Utc::now())
            .await;
        let engine = ScriptEngine::new(vec![Ok(RunReport::default())]);
        let executor = RetryExecutor::new(
            engine.clone(),
            Arc::clone(&cancellations),
            state_with_job(&request),
        );

        let verdict = executor.execute(&request, 3).await;
        match verdict {
            RunVerdict::Cancelled(err) => {
                assert_eq!(err.queue_id, Some(request.queue_id));
                assert_eq!(err.run_id, Some(request.run_id));
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_between_attempts_stops_the_retry() {
        let request = request();
        let state = state_with_job(&request);
        let cancellations = Arc::new(CancellationRegistry::new());
        let engine = Arc::new(SelfCancellingEngine {
            cancellations: Arc::clone(&cancellations),
        });
        let executor = RetryExecutor::new(engine, cancellations, Arc::clone(&state));

        let verdict = executor.execute(&request, 3).await;
        assert!(matches!(verdict, RunVerdict::Cancelled(_)));

        let guard = state.lock().await;
        let job = guard.jobs.get(&request.queue_id).unwrap();
        assert_eq!(job.attempts, 1, "the in-flight attempt still counts");
        assert_eq!(job.failure_reasons.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_during_the_final_attempt_outranks_exhaustion() {
        let request = request();
        let state = state_with_job(&request);
        let cancellations = Arc::new(CancellationRegistry::new());
        let engine = Arc::new(SelfCancellingEngine {
            cancellations: Arc::clone(&cancellations),
        });
        let executor = RetryExecutor::new(engine, cancellations, Arc::clone(&state));

        let verdict = executor.execute(&request, 1).await;
        match verdict {
            RunVerdict::Cancelled(err) => {
                assert_eq!(err.queue_id, Some(request.queue_id));
                assert_eq!(err.run_id, Some(request.run_id));
            }
            other => panic!("unexpected verdict: {other:?}"),
        }

        let guard = state.lock().await;
        let job = guard.jobs.get(&request.queue_id).unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.failure_reasons, vec!["interrupted".to_string()]);
    }
}
