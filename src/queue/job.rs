//! Job model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::RunReport;
use crate::error::QueueError;

/// Lifecycle states of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether a job may move from `self` to `target`.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// A unit of work owned by the queue.
///
/// Mutation happens only inside the queue's state lock; every read hands out
/// a clone.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Stable identity assigned at submission. Never reused.
    pub queue_id: Uuid,
    /// Engine-facing identity, assigned once when the job first runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub status: JobStatus,
    /// Completed engine invocations, successful or failed.
    pub attempts: u32,
    /// One diagnostic entry per failed attempt, oldest first.
    pub failure_reasons: Vec<String>,
    /// Retry budget frozen at submission.
    pub max_attempts: u32,
    pub requester_id: String,
    /// Opaque task reference; the queue never looks inside.
    pub payload: String,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal error message for failed or cancelled jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final or last partial engine report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RunReport>,
}

impl Job {
    pub fn new(
        payload: impl Into<String>,
        requester_id: impl Into<String>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            queue_id: Uuid::new_v4(),
            run_id: None,
            status: JobStatus::Queued,
            attempts: 0,
            failure_reasons: Vec::new(),
            max_attempts,
            requester_id: requester_id.into(),
            payload: payload.into(),
            cancel_requested: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
        }
    }

    /// Moves the job to `target`, stamping `started_at`/`finished_at` as the
    /// state machine requires. Rejects anything outside the matrix.
    pub fn transition_to(
        &mut self,
        target: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if !self.status.can_transition_to(target) {
            return Err(QueueError::InvalidTransition {
                queue_id: self.queue_id,
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        match target {
            JobStatus::Running => self.started_at = Some(now),
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => {
                self.finished_at = Some(now)
            }
            JobStatus::Queued => {}
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Running time against `now`; zero before the job starts.
    pub fn elapsed(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.started_at
            .map(|started| (now - started).to_std().unwrap_or_default())
            .unwrap_or_default()
    }
}
