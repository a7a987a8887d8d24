//! Detector observations

use serde::{Deserialize, Serialize};

/// One label a detector attached to an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelObservation {
    pub name: String,
    /// Confidence in percent, 0.0 to 100.0
    pub confidence: f32,
}

impl LabelObservation {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// Bounding box as ratios of the image size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// One fragment of text found in an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub region: Option<Region>,
}

impl TextFragment {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
            region: None,
        }
    }
}

impl From<&str> for TextFragment {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_without_region_deserializes() {
        let fragment: TextFragment = serde_json::from_str(r#"{"text":"HWY"}"#).unwrap();
        assert_eq!(fragment.text, "HWY");
        assert!(fragment.region.is_none());
        assert!(fragment.confidence.is_none());
    }
}
