//! Detector answering from a fixture table
//!
//! Fixture files map item identifiers to canned answers:
//!
//! ```json
//! { "items": {
//!     "A.jpg": { "labels": [{ "name": "Car", "confidence": 95.0 }], "text": ["HWY", "101"] },
//!     "B.jpg": { "error": "transient" }
//! } }
//! ```
//!
//! Items missing from the table are rejected, like an unknown image would be.

use crate::detector::Detector;
use crate::error::DetectError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sifter_core::{ImageRef, LabelObservation, TextFragment};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Failure a fixture entry should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureFailure {
    Transient,
    Rejected,
    Unrecoverable,
}

impl FixtureFailure {
    fn to_error(self, image: &ImageRef) -> DetectError {
        match self {
            FixtureFailure::Transient => {
                DetectError::Transient(format!("simulated outage for {}", image))
            }
            FixtureFailure::Rejected => {
                DetectError::Rejected(format!("simulated invalid image {}", image))
            }
            FixtureFailure::Unrecoverable => {
                DetectError::Unrecoverable(format!("simulated access denied for {}", image))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum FixtureText {
    Plain(String),
    Fragment(TextFragment),
}

impl From<FixtureText> for TextFragment {
    fn from(text: FixtureText) -> Self {
        match text {
            FixtureText::Plain(text) => TextFragment::new(text),
            FixtureText::Fragment(fragment) => fragment,
        }
    }
}

/// Canned answer for one item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureEntry {
    #[serde(default)]
    pub labels: Vec<LabelObservation>,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub text: Vec<TextFragment>,
    #[serde(default)]
    pub error: Option<FixtureFailure>,
}

fn deserialize_text<'de, D>(deserializer: D) -> Result<Vec<TextFragment>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Vec::<FixtureText>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(TextFragment::from).collect())
}

#[derive(Debug, Default, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    items: HashMap<String, FixtureEntry>,
}

/// Detector that looks answers up in a table and records every call
#[derive(Default)]
pub struct FixtureDetector {
    entries: RwLock<HashMap<String, FixtureEntry>>,
    calls: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FixtureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON, TOML or YAML fixture file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DetectError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DetectError::Unrecoverable(format!("cannot read fixture {}: {}", path.display(), e))
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let file: FixtureFile = match extension.as_deref() {
            Some("toml") => toml::from_str(&content).map_err(|e| e.to_string()),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
            _ => serde_json::from_str(&content).map_err(|e| e.to_string()),
        }
        .map_err(|e| DetectError::Decode(format!("fixture {}: {}", path.display(), e)))?;

        info!("Loaded {} fixture entries from {}", file.items.len(), path.display());
        Ok(Self {
            entries: RwLock::new(file.items),
            ..Self::default()
        })
    }

    pub fn with_entry(self, item: &str, entry: FixtureEntry) -> Self {
        self.entries.write().insert(item.to_string(), entry);
        self
    }

    /// Set the labels of `item`, keeping any text already configured
    pub fn with_labels(self, item: &str, labels: Vec<LabelObservation>) -> Self {
        self.entries
            .write()
            .entry(item.to_string())
            .or_default()
            .labels = labels;
        self
    }

    /// Set the text fragments of `item`, keeping any labels already configured
    pub fn with_text(self, item: &str, fragments: &[&str]) -> Self {
        self.entries
            .write()
            .entry(item.to_string())
            .or_default()
            .text = fragments.iter().map(|f| TextFragment::new(*f)).collect();
        self
    }

    pub fn with_failure(self, item: &str, failure: FixtureFailure) -> Self {
        self.entries
            .write()
            .entry(item.to_string())
            .or_default()
            .error = Some(failure);
        self
    }

    /// Calls made so far, as `labels:<item>` / `text:<item>`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lookup(&self, kind: &str, image: &ImageRef) -> Result<FixtureEntry, DetectError> {
        if self.is_closed() {
            return Err(DetectError::Closed("fixture".to_string()));
        }
        self.calls.lock().push(format!("{}:{}", kind, image.item));

        let entry = self
            .entries
            .read()
            .get(image.item.as_str())
            .cloned()
            .ok_or_else(|| DetectError::Rejected(format!("unknown image {}", image)))?;

        match entry.error {
            Some(failure) => Err(failure.to_error(image)),
            None => Ok(entry),
        }
    }
}

#[async_trait]
impl Detector for FixtureDetector {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn detect_labels(&self, image: &ImageRef) -> Result<Vec<LabelObservation>, DetectError> {
        let entry = self.lookup("labels", image)?;
        debug!("Fixture labels for {}: {}", image, entry.labels.len());
        Ok(entry.labels)
    }

    async fn detect_text(&self, image: &ImageRef) -> Result<Vec<TextFragment>, DetectError> {
        let entry = self.lookup("text", image)?;
        debug!("Fixture text for {}: {}", image, entry.text.len());
        Ok(entry.text)
    }

    async fn close(&self) -> Result<(), DetectError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
