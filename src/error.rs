//! Error taxonomy for the run queue.

use uuid::Uuid;

use crate::engine::RunReport;
use crate::queue::JobStatus;

/// Raised when a run is aborted by a cancellation request.
///
/// Never counts toward the attempt budget; the job surfaces it as status
/// `cancelled` with this message as the terminal error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CancellationError {
    pub message: String,
    pub run_id: Option<Uuid>,
    pub queue_id: Option<Uuid>,
}

impl CancellationError {
    /// Cancellation observed at a poll point of a dispatched run.
    pub fn for_run(queue_id: Uuid, run_id: Option<Uuid>) -> Self {
        Self {
            message: format!("Run cancelled by request (queue id {queue_id})"),
            run_id,
            queue_id: Some(queue_id),
        }
    }
}

/// Raised when every attempt failed and the retry budget is spent.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Retry limit reached after {attempts} of {max_attempts} attempts")]
pub struct RetryExhaustedError {
    pub attempts: u32,
    pub max_attempts: u32,
    /// One diagnostic entry per failed attempt, oldest first.
    pub reasons: Vec<String>,
    /// Report from the final attempt, when the engine produced one.
    pub last_report: Option<RunReport>,
}

/// Failures surfaced by queue operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Job {queue_id} not found")]
    NotFound { queue_id: Uuid },

    #[error("Job {queue_id} cannot move from {from} to {to}")]
    InvalidTransition {
        queue_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

/// A single failed engine attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Run attempt failed: {reason}")]
pub struct AttemptFailure {
    pub reason: String,
    /// Partial report, when the engine got far enough to produce one.
    pub report: Option<RunReport>,
}

impl AttemptFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            report: None,
        }
    }

    pub fn with_report(reason: impl Into<String>, report: RunReport) -> Self {
        Self {
            reason: reason.into(),
            report: Some(report),
        }
    }
}

/// Delivery collaborator failure; logged and absorbed by the notifier.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Notification delivery failed: {message}")]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
