//! sifter-stage: the pipeline stages and their driver
//!
//! - `FilterStage`: label-gated forwarding, fed by a collection listing (scan)
//!   or by an upstream queue (person filter)
//! - `ExtractionStage`: text extraction into an output sink
//! - `driver`: builds the clients from a `PipelineConfig`, runs one stage or the
//!   whole pipeline, and closes every client on the way out

pub mod error;
pub mod report;
pub mod filter;
pub mod extract;
pub mod sink;
pub mod driver;

pub use error::StageError;
pub use report::{StageReport, PipelineReport};
pub use filter::{FilterStage, Forwarder, InputSource, LabelFilter, Verdict};
pub use extract::ExtractionStage;
pub use sink::{OutputSink, FileSink, MemorySink, SinkMode};
pub use driver::{RunMode, StageContext, run_scan, run_person, run_extract, run_pipeline};
