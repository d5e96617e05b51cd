//! Execution engine seam.
//!
//! The queue never runs task content itself. It hands a [`RunRequest`] to an
//! [`ExecutionEngine`] implementation and observes the outcome; everything
//! engine-specific travels inside the opaque report metadata.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AttemptFailure;

/// One attempt of one job, as handed to the engine.
#[derive(Debug, Clone, Serialize)]
pub struct RunRequest {
    pub queue_id: Uuid,
    pub run_id: Uuid,
    /// 1-based attempt number for this invocation.
    pub attempt: u32,
    /// Opaque task reference, passed through untouched.
    pub payload: String,
    pub requester_id: String,
}

impl RunRequest {
    /// Copy of this request stamped with a new attempt number.
    pub fn for_attempt(&self, attempt: u32) -> RunRequest {
        RunRequest {
            attempt,
            ..self.clone()
        }
    }
}

/// The engine's account of one completed attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub duration: Duration,
    /// Engine-specific extras (exit codes, artifact paths, ...).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl RunReport {
    pub fn with_output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }
}

/// Runs task content on behalf of the queue.
///
/// `Err` means the attempt failed and counts toward the retry budget; the
/// failure carries a diagnostic reason and any partial report the engine
/// managed to produce.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn run_attempt(&self, request: &RunRequest) -> Result<RunReport, AttemptFailure>;
}
