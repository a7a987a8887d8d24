//! Error types for sifter-queue

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue '{0}' is closed")]
    Closed(String),

    #[error("Invalid queue name: {0}")]
    InvalidName(String),

    #[error("Invalid message group: {0}")]
    InvalidGroup(String),

    #[error("Corrupt queue entry: {0}")]
    Corrupt(String),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Corrupt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::Closed("car_indexes".to_string());
        assert!(err.to_string().contains("car_indexes"));
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_queue_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: QueueError = io_err.into();
        match err {
            QueueError::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }
}
