//! sifter-clients: external collaborators of the pipeline
//!
//! The detection engine and the image store are consumed through two narrow
//! capabilities, `Detector` and `ObjectStore`. Adapters:
//! - `HttpDetector`: JSON-over-HTTP detection service
//! - `FixtureDetector`: canned answers, for offline runs and tests
//! - `LocalStore`: one directory per collection
//! - `MemoryStore`: in-memory collections

pub mod error;
pub mod detector;
pub mod http;
pub mod fixture;
pub mod store;

pub use error::{DetectError, StoreError};
pub use detector::Detector;
pub use http::HttpDetector;
pub use fixture::{FixtureDetector, FixtureEntry, FixtureFailure};
pub use store::{ObjectStore, LocalStore, MemoryStore};
