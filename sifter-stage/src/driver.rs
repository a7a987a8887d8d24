//! Stage wiring: clients from configuration, stage runs, shutdown
//!
//! Every `run_*` entry point closes the detector, the store and all opened
//! queues before returning, whether the stage succeeded or not.
//!
//! A fresh run forgets the dedup keys of the queues it writes to, so items and
//! the stop sentinel of an earlier run within the dedup window are sent again.
//! A resumed run keeps them and only fills in what the interrupted run missed.

use crate::error::StageError;
use crate::extract::ExtractionStage;
use crate::filter::{FilterStage, InputSource, LabelFilter};
use crate::report::{PipelineReport, StageReport};
use crate::sink::{FileSink, OutputSink, SinkMode};
use parking_lot::Mutex;
use sifter_clients::{Detector, FixtureDetector, HttpDetector, LocalStore, ObjectStore};
use sifter_core::{DetectorConfig, PipelineConfig, QueueBackend};
use sifter_queue::{MemoryQueue, QueueOptions, SpoolQueue, WorkQueue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Whether a run starts over or continues an interrupted one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Forget output dedup keys and truncate the output file
    #[default]
    Fresh,
    /// Keep output dedup keys and append to the output file
    Resume,
}

impl RunMode {
    pub fn sink_mode(self) -> SinkMode {
        match self {
            RunMode::Fresh => SinkMode::Truncate,
            RunMode::Resume => SinkMode::Append,
        }
    }

    /// Make `output` ready for a run in this mode
    async fn prepare(self, output: &dyn WorkQueue) -> Result<(), StageError> {
        if self == RunMode::Fresh {
            let forgotten = output.forget_keys().await?;
            if forgotten > 0 {
                info!(
                    "Fresh run: forgot {} dedup keys of '{}'",
                    forgotten,
                    output.name()
                );
            }
        }
        Ok(())
    }
}

/// Clients shared by the stages of one process
pub struct StageContext {
    config: PipelineConfig,
    detector: Arc<dyn Detector>,
    store: Arc<dyn ObjectStore>,
    queues: Mutex<HashMap<String, Arc<dyn WorkQueue>>>,
}

impl StageContext {
    /// Use the given clients; queues are still opened from `config`
    pub fn new(
        config: PipelineConfig,
        detector: Arc<dyn Detector>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            detector,
            store,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Validate `config` and build the clients it describes
    pub fn from_config(config: PipelineConfig) -> Result<Self, StageError> {
        config.validate()?;

        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(config.store.root.clone()));
        let detector: Arc<dyn Detector> = match &config.detector {
            DetectorConfig::Http {
                endpoint,
                api_key,
                request_timeout_secs,
                upload_images,
            } => {
                let mut detector = HttpDetector::new(endpoint.clone())?;
                if let Some(key) = api_key {
                    detector = detector.with_api_key(key.clone());
                }
                if let Some(secs) = request_timeout_secs {
                    detector = detector.with_timeout(Duration::from_secs(*secs))?;
                }
                if *upload_images {
                    detector = detector.with_image_upload(store.clone());
                }
                info!("Using detection service at {}", detector.endpoint());
                Arc::new(detector)
            }
            DetectorConfig::Fixture { path } => Arc::new(FixtureDetector::from_file(path)?),
        };

        Ok(Self::new(config, detector, store))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detector(&self) -> Arc<dyn Detector> {
        self.detector.clone()
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Register a queue under `name`, replacing the configured backend for it
    pub fn with_queue(self, name: &str, queue: Arc<dyn WorkQueue>) -> Self {
        self.queues.lock().insert(name.to_string(), queue);
        self
    }

    /// Queue `name`, opened on first use and shared afterwards
    pub async fn queue(&self, name: &str) -> Result<Arc<dyn WorkQueue>, StageError> {
        let existing = self.queues.lock().get(name).cloned();
        if let Some(queue) = existing {
            return Ok(queue);
        }

        let options = QueueOptions::from_config(&self.config.queue);
        let opened: Arc<dyn WorkQueue> = match &self.config.queue.backend {
            QueueBackend::Memory => Arc::new(MemoryQueue::with_options(name, options)),
            QueueBackend::Spool { root } => Arc::new(SpoolQueue::open(root, name, options).await?),
        };

        // Another task may have opened it meanwhile; keep the first one
        let mut queues = self.queues.lock();
        Ok(queues.entry(name.to_string()).or_insert(opened).clone())
    }

    /// Close every client, reporting the first failure
    pub async fn close(&self) -> Result<(), StageError> {
        let mut first: Option<StageError> = None;

        if let Err(e) = self.detector.close().await {
            warn!("Closing detector '{}' failed: {}", self.detector.name(), e);
            first = first.or(Some(e.into()));
        }
        if let Err(e) = self.store.close().await {
            warn!("Closing store '{}' failed: {}", self.store.name(), e);
            first = first.or(Some(e.into()));
        }

        let queues: Vec<Arc<dyn WorkQueue>> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            if let Err(e) = queue.close().await {
                warn!("Closing queue '{}' failed: {}", queue.name(), e);
                first = first.or(Some(e.into()));
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn scan(&self, mode: RunMode) -> Result<StageReport, StageError> {
        let scan = &self.config.scan;
        let output = self.queue(&scan.output_queue).await?;
        mode.prepare(output.as_ref()).await?;
        let stage = FilterStage::new(
            self.detector(),
            self.config.store.collection.clone(),
            LabelFilter::new(scan.label.clone(), scan.threshold),
            output,
            scan.group(),
        );
        stage.run(InputSource::Listing { store: self.store() }).await
    }

    async fn filter_people(&self, mode: RunMode) -> Result<StageReport, StageError> {
        let person = &self.config.person;
        let input = self.queue(&person.input_queue).await?;
        let output = self.queue(&person.output_queue).await?;
        mode.prepare(output.as_ref()).await?;
        let stage = FilterStage::new(
            self.detector(),
            self.config.store.collection.clone(),
            LabelFilter::new(person.label.clone(), person.threshold),
            output,
            person.group(),
        );
        stage
            .run(InputSource::Queue {
                queue: input,
                wait: self.config.queue.wait(),
                drain_polls: person.drain_polls,
            })
            .await
    }

    async fn extract(&self, mode: SinkMode) -> Result<StageReport, StageError> {
        let input = self.queue(&self.config.extract.input_queue).await?;
        let mut sink = FileSink::open(&self.config.extract.output_path, mode).await?;
        let stage = ExtractionStage::new(
            self.detector(),
            self.config.store.collection.clone(),
            self.config.queue.wait(),
        );

        let result = stage.run(input.as_ref(), &mut sink).await;
        let closed = sink.close().await;
        let report = result?;
        closed?;
        Ok(report)
    }
}

/// Close `ctx` after a stage, keeping the stage's error if both fail
async fn finish<T>(ctx: &StageContext, result: Result<T, StageError>) -> Result<T, StageError> {
    let closed = ctx.close().await;
    let value = result?;
    closed?;
    Ok(value)
}

/// Stage 1: scan the configured collection
pub async fn run_scan(ctx: &StageContext, mode: RunMode) -> Result<StageReport, StageError> {
    let result = ctx.scan(mode).await;
    finish(ctx, result).await
}

/// Stage 2: filter the scanned stream
pub async fn run_person(ctx: &StageContext, mode: RunMode) -> Result<StageReport, StageError> {
    let result = ctx.filter_people(mode).await;
    finish(ctx, result).await
}

/// Stage 3: extract text of the filtered stream into the output file
pub async fn run_extract(ctx: &StageContext, mode: SinkMode) -> Result<StageReport, StageError> {
    let result = ctx.extract(mode).await;
    finish(ctx, result).await
}

/// All three stages concurrently in this process.
///
/// The first stage failure cancels the others, since downstream stages would
/// otherwise wait forever for a sentinel that is never sent.
pub async fn run_pipeline(ctx: &StageContext, mode: RunMode) -> Result<PipelineReport, StageError> {
    let result = tokio::try_join!(
        ctx.scan(mode),
        ctx.filter_people(mode),
        ctx.extract(mode.sink_mode())
    )
        .map(|(scan, person, extract)| PipelineReport {
            scan,
            person,
            extract,
        });
    finish(ctx, result).await
}
