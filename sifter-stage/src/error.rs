//! Error types for sifter-stage

use sifter_clients::{DetectError, StoreError};
use sifter_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Detector error: {0}")]
    Detect(#[from] DetectError),

    #[error("Output error: {0}")]
    Sink(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] sifter_core::Error),

    #[error("Stream '{0}' already ended")]
    StreamEnded(String),

    #[error("Stop sentinel on '{0}' was suppressed as a duplicate")]
    SentinelSuppressed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        let err: StageError = QueueError::Unavailable("spool".to_string()).into();
        assert!(matches!(err, StageError::Queue(_)));

        let err: StageError = StoreError::CollectionNotFound("bucket".to_string()).into();
        assert!(err.to_string().contains("bucket"));

        let err: StageError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, StageError::Sink(_)));
    }
}
