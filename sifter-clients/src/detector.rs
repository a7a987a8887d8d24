//! Detection capability

use crate::error::DetectError;
use async_trait::async_trait;
use sifter_core::{ImageRef, LabelObservation, TextFragment};

/// Label and text detection on a stored image
#[async_trait]
pub trait Detector: Send + Sync {
    /// Adapter name, for logs
    fn name(&self) -> &str;

    /// Labels with confidences (0-100) found in the image
    async fn detect_labels(&self, image: &ImageRef) -> Result<Vec<LabelObservation>, DetectError>;

    /// Text fragments found in the image, in detector order
    async fn detect_text(&self, image: &ImageRef) -> Result<Vec<TextFragment>, DetectError>;

    /// Release the client
    async fn close(&self) -> Result<(), DetectError> {
        Ok(())
    }
}
