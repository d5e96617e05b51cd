//! Delivery seam for long-run notices.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::SinkError;

/// One "still running" notice for a long-lived job.
#[derive(Debug, Clone, Serialize)]
pub struct LongRunNotice {
    pub queue_id: Uuid,
    pub run_id: Uuid,
    pub payload: String,
    pub requester_id: String,
    pub started_at: DateTime<Utc>,
    /// Wall-clock time the job has been running when the notice fired.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// 1 for the first notice on a job, then counting up.
    pub sequence: u32,
}

/// Transport for progress notices. Implementations decide where a notice
/// lands (chat channel, log line, test buffer).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn deliver(&self, notice: &LongRunNotice) -> Result<(), SinkError>;
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
