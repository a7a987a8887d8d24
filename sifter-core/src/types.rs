//! Item identifiers and image references

use crate::error::{Error, Result};
use crate::message::SENTINEL;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque name of one image inside a collection.
///
/// Any string except the stop sentinel is a valid identifier. Identifiers are
/// not otherwise validated: a malformed one is handed to the detector as-is and
/// its rejection is handled as a per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Create an identifier, refusing the reserved sentinel value
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id == SENTINEL {
            return Err(Error::InvalidItem(format!(
                "'{}' is reserved for the stop sentinel",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    // Only the body decoder may skip the sentinel check, it has already done it.
    pub(crate) fn from_decoded(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ItemId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for ItemId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

/// Reference to one image: the collection it lives in plus its identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub collection: String,
    pub item: ItemId,
}

impl ImageRef {
    pub fn new(collection: impl Into<String>, item: ItemId) -> Self {
        Self {
            collection: collection.into(),
            item,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.item)
    }
}
