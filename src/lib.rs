//! Runq, a single-slot FIFO queue for AI-assisted coding runs.

pub mod clock;
pub mod engine;
pub mod error;
pub mod harness;
pub mod notify;
pub mod queue;
pub mod settings;
