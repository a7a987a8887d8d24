use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid item identifier: {0}")]
    InvalidItem(String),
}

pub type Result<T> = std::result::Result<T, Error>;
