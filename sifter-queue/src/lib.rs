//! sifter-queue: work queues connecting pipeline stages
//!
//! Provides:
//! - The `WorkQueue` capability: append / long-poll take / idempotent ack
//! - FIFO ordering per message group, with a group blocked while one of its
//!   messages is in flight
//! - Deduplication of re-appended bodies within a time window
//! - Redelivery of unacknowledged messages after a visibility timeout
//! - `MemoryQueue` for single-process pipelines and `SpoolQueue` for stages
//!   running as separate processes on one host

pub mod error;
pub mod queue;
pub mod memory;
pub mod spool;

pub use error::QueueError;
pub use queue::{
    AppendOutcome, MessageId, QueueMessage, QueueOptions, QueueStats, ReceiptHandle, WorkQueue,
};
pub use memory::MemoryQueue;
pub use spool::SpoolQueue;
