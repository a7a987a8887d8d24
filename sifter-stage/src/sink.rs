//! Output sinks for extracted records

use crate::error::StageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use sifter_core::OutputRecord;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Destination of extraction records; one `append` per item
#[async_trait]
pub trait OutputSink: Send {
    async fn append(&mut self, record: &OutputRecord) -> Result<(), StageError>;

    async fn close(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// How a file sink treats an existing output file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SinkMode {
    /// Start the run with an empty file
    #[default]
    Truncate,
    /// Keep earlier records, for resuming an interrupted extraction
    Append,
}

/// Tab-separated `item\tcontent` lines, flushed after every record
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    written: usize,
    resumed: usize,
}

impl FileSink {
    pub async fn open(path: impl AsRef<Path>, mode: SinkMode) -> Result<Self, StageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let resumed = match mode {
            SinkMode::Truncate => 0,
            SinkMode::Append => count_records(&path).await?,
        };

        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            SinkMode::Truncate => options.write(true).truncate(true),
            SinkMode::Append => options.append(true),
        };
        let file = options.open(&path).await?;

        if resumed > 0 {
            info!(
                "Writing records to {} after {} existing ones",
                path.display(),
                resumed
            );
        } else {
            info!("Writing records to {} ({:?})", path.display(), mode);
        }
        Ok(Self {
            path,
            file: Some(file),
            written: 0,
            resumed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Records already in the file when it was opened for appending
    pub fn resumed(&self) -> usize {
        self.resumed
    }
}

/// Well-formed records in an existing output file
async fn count_records(path: &Path) -> Result<usize, StageError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut records = 0;
    for (number, line) in content.lines().enumerate() {
        if OutputRecord::parse_line(line).is_some() {
            records += 1;
        } else {
            warn!("Line {} of {} is not a record", number + 1, path.display());
        }
    }
    Ok(records)
}

#[async_trait]
impl OutputSink for FileSink {
    async fn append(&mut self, record: &OutputRecord) -> Result<(), StageError> {
        let file = self.file.as_mut().ok_or_else(|| {
            StageError::Sink(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("{} is closed", self.path.display()),
            ))
        })?;

        let mut line = record.to_line();
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        self.written += 1;
        debug!("Appended record for {} to {}", record.item, self.path.display());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StageError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// Sink keeping records in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<OutputRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OutputRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn append(&mut self, record: &OutputRecord) -> Result<(), StageError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
