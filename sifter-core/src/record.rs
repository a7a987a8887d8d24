//! Output records of the extraction stage

use crate::types::ItemId;
use serde::{Deserialize, Serialize};

/// Text extracted from one image.
///
/// Empty content is meaningful: nothing was detected (or detection failed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub item: ItemId,
    pub content: String,
}

impl OutputRecord {
    pub fn new(item: ItemId, content: impl Into<String>) -> Self {
        Self {
            item,
            content: content.into(),
        }
    }

    /// Join fragment texts in the order returned, separated by one space
    pub fn from_fragments<S: AsRef<str>>(item: ItemId, fragments: &[S]) -> Self {
        let content = fragments
            .iter()
            .map(|f| f.as_ref())
            .collect::<Vec<_>>()
            .join(" ");
        Self { item, content }
    }

    /// Sink line without the trailing newline: `item \t content`.
    ///
    /// Tabs and line breaks inside either field are replaced by spaces so a
    /// record always occupies exactly one line.
    pub fn to_line(&self) -> String {
        format!("{}\t{}", flatten(self.item.as_str()), flatten(&self.content))
    }

    /// Parse a line produced by [`OutputRecord::to_line`]
    pub fn parse_line(line: &str) -> Option<Self> {
        let (item, content) = line.split_once('\t')?;
        let item = ItemId::new(item).ok()?;
        Some(Self::new(item, content))
    }
}

fn flatten(s: &str) -> String {
    s.replace(['\t', '\r', '\n'], " ")
}
