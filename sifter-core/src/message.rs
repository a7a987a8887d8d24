//! Queue message bodies and the stop sentinel
//!
//! On the wire a body is either an item identifier or the reserved value `"-1"`.
//! Bodies are decoded into [`QueueBody`] as soon as they are received so that
//! stage logic dispatches on the variant instead of comparing strings.

use crate::types::ItemId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire value of the end-of-stream marker
pub const SENTINEL: &str = "-1";

/// Decoded queue message body
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueBody {
    /// A unit of work
    Item(ItemId),
    /// No further items will follow in this group
    Stop,
}

impl QueueBody {
    /// Decode a raw body received from a queue
    pub fn decode(body: &str) -> Self {
        if body == SENTINEL {
            QueueBody::Stop
        } else {
            QueueBody::Item(ItemId::from_decoded(body.to_string()))
        }
    }

    /// Wire representation of this body
    pub fn encode(&self) -> &str {
        match self {
            QueueBody::Item(id) => id.as_str(),
            QueueBody::Stop => SENTINEL,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, QueueBody::Stop)
    }

    /// Deduplication key of this body within `group`
    pub fn dedup_key(&self, group: &str) -> String {
        dedup_key(group, self.encode())
    }
}

impl From<ItemId> for QueueBody {
    fn from(id: ItemId) -> Self {
        QueueBody::Item(id)
    }
}

impl fmt::Display for QueueBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueBody::Item(id) => write!(f, "{}", id),
            QueueBody::Stop => f.write_str("<stop>"),
        }
    }
}

/// Deterministic deduplication key for a raw body appended to `group`
pub fn dedup_key(group: &str, body: &str) -> String {
    format!("{}:{}", group, body)
}
