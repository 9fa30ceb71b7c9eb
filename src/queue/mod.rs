//! Durable classification queue: backoff policy and the worker that drains it.

pub mod backoff;
pub mod worker;

pub use backoff::{BackoffPolicy, QueueSettings};
pub use worker::{ClassificationController, ClassificationWorker, WorkerReport};
