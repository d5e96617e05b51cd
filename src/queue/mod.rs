//! Job queue: lifecycle model, cancellation registry, retry executor, and
//! the FIFO manager that ties them together.

pub mod cancel;
pub mod job;
pub mod manager;
pub mod retry;

pub use cancel::CancellationRegistry;
pub use job::{Job, JobStatus};
pub use manager::{
    CancelOutcome, QueueConfig, QueueSnapshot, QueueSummary, RunObserver, RunQueue,
};
pub use retry::{RetryExecutor, RunVerdict};
