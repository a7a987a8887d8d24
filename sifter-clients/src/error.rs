//! Error types for sifter-clients

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Transient detection failure: {0}")]
    Transient(String),

    #[error("Image rejected by detector: {0}")]
    Rejected(String),

    #[error("Unrecoverable detector error: {0}")]
    Unrecoverable(String),

    #[error("Invalid detector response: {0}")]
    Decode(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Detector '{0}' is closed")]
    Closed(String),
}

impl DetectError {
    /// Errors that will not go away by trying another item
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, DetectError::Unrecoverable(_) | DetectError::Closed(_))
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
