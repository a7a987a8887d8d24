//! Label-gated forwarding
//!
//! A filter stage asks the detector for labels on each item it is fed and
//! forwards the item downstream when the target label was seen with a
//! confidence strictly above the threshold. Once its input is exhausted it
//! appends the stop sentinel, after which nothing more may be sent.

use crate::error::StageError;
use crate::report::StageReport;
use sifter_clients::{Detector, ObjectStore};
use sifter_core::{ImageRef, ItemId, LabelObservation, QueueBody};
use sifter_queue::{AppendOutcome, WorkQueue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of evaluating one item's labels
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Target label seen above the threshold
    Pass { confidence: f32 },
    /// Target label seen, never above the threshold; carries the best confidence
    Below { confidence: f32 },
    /// Target label not among the observations
    Absent,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass { .. })
    }
}

/// Predicate: `name == label && confidence > threshold`
#[derive(Debug, Clone, PartialEq)]
pub struct LabelFilter {
    pub label: String,
    pub threshold: f32,
}

impl LabelFilter {
    pub fn new(label: impl Into<String>, threshold: f32) -> Self {
        Self {
            label: label.into(),
            threshold,
        }
    }

    /// Stops at the first passing observation
    pub fn evaluate(&self, observations: &[LabelObservation]) -> Verdict {
        let mut best: Option<f32> = None;
        for observation in observations.iter().filter(|o| o.name == self.label) {
            if observation.confidence > self.threshold {
                return Verdict::Pass {
                    confidence: observation.confidence,
                };
            }
            best = Some(best.map_or(observation.confidence, |b| b.max(observation.confidence)));
        }

        match best {
            Some(confidence) => Verdict::Below { confidence },
            None => Verdict::Absent,
        }
    }

    pub fn passes(&self, observations: &[LabelObservation]) -> bool {
        self.evaluate(observations).passed()
    }
}

/// Where a filter stage gets its identifiers from
pub enum InputSource {
    /// Snapshot listing of a collection, taken once at start
    Listing { store: Arc<dyn ObjectStore> },
    /// Live pull loop against an upstream queue
    Queue {
        queue: Arc<dyn WorkQueue>,
        wait: Duration,
        /// Consecutive empty polls to wait after the sentinel before forwarding it
        drain_polls: u32,
    },
}

/// Producer side of one output stream.
///
/// Appends go to a single message group so the stream stays ordered; after
/// [`Forwarder::finish`] the stream is closed and further sends are refused.
pub struct Forwarder {
    queue: Arc<dyn WorkQueue>,
    group: String,
    finished: bool,
}

impl Forwarder {
    pub fn new(queue: Arc<dyn WorkQueue>, group: impl Into<String>) -> Self {
        Self {
            queue,
            group: group.into(),
            finished: false,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Append an item; re-sending the same item within the dedup window is a
    /// no-op reported as a duplicate
    pub async fn forward(&self, item: &ItemId) -> Result<AppendOutcome, StageError> {
        if self.finished {
            return Err(StageError::StreamEnded(self.group.clone()));
        }
        let outcome = self
            .queue
            .send(&self.group, &QueueBody::Item(item.clone()))
            .await?;
        if outcome.duplicate {
            info!(
                "{} already enqueued to '{}' (message {})",
                item,
                self.queue.name(),
                outcome.id
            );
        } else {
            info!("Enqueued {} to '{}' (message {})", item, self.queue.name(), outcome.id);
        }
        Ok(outcome)
    }

    /// Append the stop sentinel and close the stream.
    ///
    /// Fails if the sentinel was suppressed as a duplicate: a consumer waiting
    /// for this run's stream would never see it end.
    pub async fn finish(&mut self) -> Result<AppendOutcome, StageError> {
        if self.finished {
            return Err(StageError::StreamEnded(self.group.clone()));
        }
        let outcome = self.queue.send(&self.group, &QueueBody::Stop).await?;
        if outcome.duplicate {
            warn!(
                "Stop sentinel to '{}' suppressed as a duplicate of message {}",
                self.queue.name(),
                outcome.id
            );
            return Err(StageError::SentinelSuppressed(self.queue.name().to_string()));
        }
        self.finished = true;
        info!("Sent stop sentinel to '{}'", self.queue.name());
        Ok(outcome)
    }
}

/// One filter stage (the collection scan or the person filter)
pub struct FilterStage {
    detector: Arc<dyn Detector>,
    collection: String,
    filter: LabelFilter,
    output: Arc<dyn WorkQueue>,
    group: String,
}

impl FilterStage {
    pub fn new(
        detector: Arc<dyn Detector>,
        collection: impl Into<String>,
        filter: LabelFilter,
        output: Arc<dyn WorkQueue>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            detector,
            collection: collection.into(),
            filter,
            output,
            group: group.into(),
        }
    }

    pub fn filter(&self) -> &LabelFilter {
        &self.filter
    }

    pub async fn run(&self, input: InputSource) -> Result<StageReport, StageError> {
        let mut forwarder = Forwarder::new(self.output.clone(), self.group.clone());
        let mut report = StageReport::default();

        match input {
            InputSource::Listing { store } => {
                // A failed listing ends the run before anything is sent downstream
                let items = store.list_items(&self.collection).await?;
                info!(
                    "Scanning {} items of '{}' for {}",
                    items.len(),
                    self.collection,
                    self.filter.label
                );
                for item in items {
                    let image = store.image_ref(&self.collection, &item);
                    self.process(&image, &forwarder, &mut report).await?;
                }
            }
            InputSource::Queue {
                queue,
                wait,
                drain_polls,
            } => {
                self.consume(queue.as_ref(), wait, drain_polls, &forwarder, &mut report)
                    .await?;
            }
        }

        forwarder.finish().await?;
        report.sentinel_forwarded = true;
        info!(
            "{} filter done: {} seen, {} forwarded, {} already enqueued, {} filtered, {} failed",
            self.filter.label,
            report.seen,
            report.forwarded,
            report.duplicates,
            report.filtered,
            report.failed
        );
        Ok(report)
    }

    /// Pull until the sentinel (plus `drain_polls` empty polls) has been seen
    async fn consume(
        &self,
        queue: &dyn WorkQueue,
        wait: Duration,
        drain_polls: u32,
        forwarder: &Forwarder,
        report: &mut StageReport,
    ) -> Result<(), StageError> {
        let mut stop_seen = false;
        let mut empty_polls = 0u32;

        loop {
            if stop_seen && empty_polls >= drain_polls {
                return Ok(());
            }

            let Some(message) = queue.take(wait).await? else {
                if stop_seen {
                    empty_polls += 1;
                    debug!("Drain poll {}/{} on '{}' was empty", empty_polls, drain_polls, queue.name());
                } else {
                    debug!("No messages on '{}', polling again", queue.name());
                }
                continue;
            };
            queue.ack(&message).await?;

            if message.receive_count > 1 {
                report.redelivered += 1;
                warn!(
                    "Message {} on '{}' delivered {} times",
                    message.id,
                    queue.name(),
                    message.receive_count
                );
            }

            match message.decode() {
                QueueBody::Stop if stop_seen => {
                    debug!("Ignoring repeated stop sentinel on '{}'", queue.name());
                }
                QueueBody::Stop => {
                    info!("Received stop sentinel on '{}'", queue.name());
                    stop_seen = true;
                }
                QueueBody::Item(item) => {
                    debug!("Dequeued {} from '{}'", item, queue.name());
                    empty_polls = 0;
                    let image = ImageRef::new(self.collection.clone(), item);
                    self.process(&image, forwarder, report).await?;
                }
            }
        }
    }

    async fn process(
        &self,
        image: &ImageRef,
        forwarder: &Forwarder,
        report: &mut StageReport,
    ) -> Result<(), StageError> {
        report.seen += 1;

        let observations = match self.detector.detect_labels(image).await {
            Ok(observations) => observations,
            Err(e) => {
                report.failed += 1;
                report.filtered += 1;
                if e.is_unrecoverable() {
                    error!("Label detection failed for {}: {}", image, e);
                } else {
                    warn!("Label detection failed for {}: {}", image, e);
                }
                return Ok(());
            }
        };

        match self.filter.evaluate(&observations) {
            Verdict::Pass { confidence } => {
                info!("{} detected in {} (confidence {:.2})", self.filter.label, image, confidence);
                if forwarder.forward(&image.item).await?.duplicate {
                    report.duplicates += 1;
                } else {
                    report.forwarded += 1;
                }
            }
            Verdict::Below { confidence } => {
                info!(
                    "{} not detected in {} (confidence {:.2} <= {:.2})",
                    self.filter.label, image, confidence, self.filter.threshold
                );
                report.filtered += 1;
            }
            Verdict::Absent => {
                debug!("No {} label in {}", self.filter.label, image);
                report.filtered += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(name: &str, confidence: f32) -> LabelObservation {
        LabelObservation::new(name, confidence)
    }

    #[test]
    fn test_strict_threshold() {
        let filter = LabelFilter::new("Car", 90.0);
        assert_eq!(filter.evaluate(&[obs("Car", 90.0)]), Verdict::Below { confidence: 90.0 });
        assert!(filter.passes(&[obs("Car", 90.01)]));
        assert!(!filter.passes(&[obs("Car", 10.0)]));
    }

    #[test]
    fn test_other_labels_ignored() {
        let filter = LabelFilter::new("Person", 90.0);
        assert_eq!(filter.evaluate(&[obs("Car", 99.0), obs("Road", 95.0)]), Verdict::Absent);
        assert_eq!(filter.evaluate(&[]), Verdict::Absent);
    }

    #[test]
    fn test_first_passing_observation_wins() {
        let filter = LabelFilter::new("Car", 90.0);
        let verdict = filter.evaluate(&[obs("Car", 50.0), obs("Car", 95.0), obs("Car", 99.0)]);
        assert_eq!(verdict, Verdict::Pass { confidence: 95.0 });
    }

    #[test]
    fn test_below_reports_best_confidence() {
        let filter = LabelFilter::new("Car", 90.0);
        let verdict = filter.evaluate(&[obs("Car", 40.0), obs("Car", 85.0), obs("Car", 60.0)]);
        assert_eq!(verdict, Verdict::Below { confidence: 85.0 });
    }

    #[test]
    fn test_label_match_is_exact() {
        let filter = LabelFilter::new("Car", 90.0);
        assert!(!filter.passes(&[obs("car", 99.0), obs("Cars", 99.0)]));
    }
}
