//! Run summaries

use serde::Serialize;

/// What one stage did during a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Items evaluated (listing entries or dequeued identifiers)
    pub seen: usize,
    /// Items appended to the output queue
    pub forwarded: usize,
    /// Passing items the output queue already held from an earlier attempt
    pub duplicates: usize,
    /// Items that did not pass the label predicate
    pub filtered: usize,
    /// Items whose detection call failed
    pub failed: usize,
    /// Records written to the output sink
    pub records: usize,
    /// Messages received more than once
    pub redelivered: usize,
    /// Whether the stop sentinel was sent downstream
    pub sentinel_forwarded: bool,
}

/// Reports of a whole pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub scan: StageReport,
    pub person: StageReport,
    pub extract: StageReport,
}
