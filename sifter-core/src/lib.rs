//! sifter-core: shared vocabulary of the sifter pipeline
//!
//! Provides:
//! - Item identifiers and image references
//! - Queue bodies with the in-band stop sentinel decoded into a tagged variant
//! - Label/text observations returned by detectors
//! - Output records written by the extraction stage
//! - Pipeline configuration and the core error type

pub mod error;
pub mod types;
pub mod message;
pub mod observation;
pub mod record;
pub mod config;

pub use error::{Error, Result};
pub use types::{ItemId, ImageRef};
pub use message::{QueueBody, SENTINEL, dedup_key};
pub use observation::{LabelObservation, TextFragment, Region};
pub use record::OutputRecord;
pub use config::{
    PipelineConfig, StoreConfig, DetectorConfig, QueueConfig, QueueBackend,
    ScanStageConfig, PersonStageConfig, ExtractStageConfig,
};
