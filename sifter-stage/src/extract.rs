//! Text extraction stage

use crate::error::StageError;
use crate::report::StageReport;
use crate::sink::OutputSink;
use sifter_clients::Detector;
use sifter_core::{ImageRef, OutputRecord, QueueBody};
use sifter_queue::WorkQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consumes identifiers and writes one record of detected text per item
pub struct ExtractionStage {
    detector: Arc<dyn Detector>,
    collection: String,
    wait: Duration,
}

impl ExtractionStage {
    pub fn new(detector: Arc<dyn Detector>, collection: impl Into<String>, wait: Duration) -> Self {
        Self {
            detector,
            collection: collection.into(),
            wait,
        }
    }

    /// Run until the stop sentinel arrives on `input`.
    ///
    /// Every item yields exactly one record, with empty content when detection
    /// fails. Only queue and sink failures end the run early.
    pub async fn run(
        &self,
        input: &dyn WorkQueue,
        sink: &mut dyn OutputSink,
    ) -> Result<StageReport, StageError> {
        let mut report = StageReport::default();

        loop {
            let Some(message) = input.take(self.wait).await? else {
                debug!("No messages on '{}', polling again", input.name());
                continue;
            };
            input.ack(&message).await?;

            if message.receive_count > 1 {
                report.redelivered += 1;
                warn!(
                    "Message {} on '{}' delivered {} times",
                    message.id,
                    input.name(),
                    message.receive_count
                );
            }

            let item = match message.decode() {
                QueueBody::Stop => {
                    info!("Received stop sentinel on '{}'", input.name());
                    break;
                }
                QueueBody::Item(item) => item,
            };
            report.seen += 1;
            debug!("Dequeued {} from '{}'", item, input.name());

            let image = ImageRef::new(self.collection.clone(), item);
            let record = match self.detector.detect_text(&image).await {
                Ok(fragments) => {
                    let texts: Vec<&str> = fragments.iter().map(|f| f.text.as_str()).collect();
                    OutputRecord::from_fragments(image.item.clone(), &texts)
                }
                Err(e) => {
                    report.failed += 1;
                    if e.is_unrecoverable() {
                        error!("Text detection failed for {}: {}", image, e);
                    } else {
                        warn!("Text detection failed for {}: {}", image, e);
                    }
                    OutputRecord::new(image.item.clone(), "")
                }
            };

            sink.append(&record).await?;
            report.records += 1;
            info!("Extracted text for {}: '{}'", record.item, record.content);
        }

        info!(
            "Extraction done: {} records, {} detection failures",
            report.records, report.failed
        );
        Ok(report)
    }
}
