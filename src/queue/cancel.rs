//! Cancellation intents, keyed by queue id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Records which jobs have been asked to stop.
///
/// Purely an intent store: the retry executor polls it before every attempt
/// and the queue clears entries on terminal transitions. Requests are
/// idempotent; the first timestamp wins, and a request is valid even for a
/// job that has not started yet.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    requests: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `queue_id` for cancellation.
    pub async fn request_cancel(&self, queue_id: Uuid, requested_at: DateTime<Utc>) {
        let mut requests = self.requests.lock().await;
        if !requests.contains_key(&queue_id) {
            requests.insert(queue_id, requested_at);
            debug!(queue_id = %queue_id, "Cancellation requested");
        }
    }

    /// The executor's cooperative check point.
    pub async fn is_cancelled(&self, queue_id: Uuid) -> bool {
        self.requests.lock().await.contains_key(&queue_id)
    }

    /// When cancellation was first requested, if at all.
    pub async fn requested_at(&self, queue_id: Uuid) -> Option<DateTime<Utc>> {
        self.requests.lock().await.get(&queue_id).copied()
    }

    /// Drops the intent once the job reaches a terminal state.
    pub async fn clear(&self, queue_id: Uuid) {
        self.requests.lock().await.remove(&queue_id);
    }
}
