//! Pipeline configuration
//!
//! Every stage reads the same file; each stage only looks at its own section
//! plus the shared `store`, `detector` and `queue` sections.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where images are listed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one subdirectory per collection
    pub root: PathBuf,
    /// Collection scanned by the first stage
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./images"),
            collection: "cs442-unr".to_string(),
        }
    }
}

/// Detection service selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    /// JSON-over-HTTP detection service
    Http {
        endpoint: String,
        #[serde(default)]
        api_key: Option<String>,
        /// Client-side timeout; `None` leaves timing to the service
        #[serde(default)]
        request_timeout_secs: Option<u64>,
        /// Send image bytes instead of a (collection, item) reference
        #[serde(default)]
        upload_images: bool,
    },
    /// Canned answers read from a fixture file
    Fixture { path: PathBuf },
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig::Http {
            endpoint: "http://127.0.0.1:8500".to_string(),
            api_key: None,
            request_timeout_secs: None,
            upload_images: false,
        }
    }
}

/// Work queue transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueBackend {
    /// In-process queues, only usable when all stages share one process
    Memory,
    /// Directory spool shared by processes on the same filesystem
    Spool { root: PathBuf },
}

impl Default for QueueBackend {
    fn default() -> Self {
        QueueBackend::Spool {
            root: PathBuf::from("./spool"),
        }
    }
}

/// Queue behaviour shared by all stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// How long a taken message stays invisible before redelivery
    pub visibility_timeout_secs: u64,
    /// How long a deduplication key suppresses re-appends
    pub dedup_window_secs: u64,
    /// Long-poll wait of one take call
    pub wait_secs: u64,
    /// Spool rescan interval while long-polling
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            visibility_timeout_secs: 30,
            dedup_window_secs: 300,
            wait_secs: 20,
            poll_interval_ms: 200,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// First stage: scan the collection for an object class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanStageConfig {
    pub label: String,
    pub threshold: f32,
    pub output_queue: String,
    /// Message group of the output stream; defaults to the queue name
    pub output_group: Option<String>,
}

impl Default for ScanStageConfig {
    fn default() -> Self {
        Self {
            label: "Car".to_string(),
            threshold: 90.0,
            output_queue: "car_indexes".to_string(),
            output_group: None,
        }
    }
}

impl ScanStageConfig {
    pub fn group(&self) -> &str {
        self.output_group.as_deref().unwrap_or(&self.output_queue)
    }
}

/// Second stage: filter the forwarded set for people
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonStageConfig {
    pub input_queue: String,
    pub label: String,
    pub threshold: f32,
    pub output_queue: String,
    pub output_group: Option<String>,
    /// Consecutive empty polls to wait for stragglers after the stop sentinel
    pub drain_polls: u32,
}

impl Default for PersonStageConfig {
    fn default() -> Self {
        Self {
            input_queue: "car_indexes".to_string(),
            label: "Person".to_string(),
            threshold: 90.0,
            output_queue: "people_indexes".to_string(),
            output_group: None,
            drain_polls: 0,
        }
    }
}

impl PersonStageConfig {
    pub fn group(&self) -> &str {
        self.output_group.as_deref().unwrap_or(&self.output_queue)
    }
}

/// Third stage: extract text into the output file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractStageConfig {
    pub input_queue: String,
    pub output_path: PathBuf,
}

impl Default for ExtractStageConfig {
    fn default() -> Self {
        Self {
            input_queue: "people_indexes".to_string(),
            output_path: PathBuf::from("output.txt"),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    pub store: StoreConfig,
    pub detector: DetectorConfig,
    pub queue: QueueConfig,
    pub scan: ScanStageConfig,
    pub person: PersonStageConfig,
    pub extract: ExtractStageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            store: StoreConfig::default(),
            detector: DetectorConfig::default(),
            queue: QueueConfig::default(),
            scan: ScanStageConfig::default(),
            person: PersonStageConfig::default(),
            extract: ExtractStageConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON, TOML or YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let parsed = match extension.as_deref() {
            Some("json") => serde_json::from_str(&content).map_err(|e| e.to_string()),
            Some("toml") => toml::from_str(&content).map_err(|e| e.to_string()),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
            _ => return Self::from_str(&content),
        };

        parsed.map_err(|e| Error::Deserialization(format!("{}: {}", path.display(), e)))
    }

    /// Load configuration from a string, trying JSON, TOML and YAML in turn
    pub fn from_str(content: &str) -> Result<Self> {
        if let Ok(config) = serde_json::from_str::<PipelineConfig>(content) {
            return Ok(config);
        }

        let toml_error = match toml::from_str::<PipelineConfig>(content) {
            Ok(config) => return Ok(config),
            Err(e) => e.to_string(),
        };

        if let Ok(config) = serde_yaml::from_str::<PipelineConfig>(content) {
            return Ok(config);
        }

        Err(Error::Deserialization(format!(
            "not valid JSON, TOML or YAML configuration ({})",
            toml_error.trim()
        )))
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `SIFTER_*` environment overrides on top of this configuration
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("SIFTER_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(root) = lookup("SIFTER_STORE_ROOT") {
            self.store.root = PathBuf::from(root);
        }

        if let Some(collection) = lookup("SIFTER_COLLECTION") {
            self.store.collection = collection;
        }

        if let Some(endpoint) = lookup("SIFTER_DETECTOR_ENDPOINT") {
            let api_key = lookup("SIFTER_DETECTOR_API_KEY");
            if let DetectorConfig::Http {
                endpoint: current,
                api_key: current_key,
                ..
            } = &mut self.detector
            {
                *current = endpoint;
                if api_key.is_some() {
                    *current_key = api_key;
                }
            } else {
                self.detector = DetectorConfig::Http {
                    endpoint,
                    api_key,
                    request_timeout_secs: None,
                    upload_images: false,
                };
            }
        } else if let Some(key) = lookup("SIFTER_DETECTOR_API_KEY") {
            if let DetectorConfig::Http { api_key, .. } = &mut self.detector {
                *api_key = Some(key);
            }
        }

        if let Some(path) = lookup("SIFTER_FIXTURE_PATH") {
            self.detector = DetectorConfig::Fixture {
                path: PathBuf::from(path),
            };
        }

        if let Some(root) = lookup("SIFTER_QUEUE_ROOT") {
            self.queue.backend = QueueBackend::Spool {
                root: PathBuf::from(root),
            };
        }

        if let Some(path) = lookup("SIFTER_OUTPUT_PATH") {
            self.extract.output_path = PathBuf::from(path);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        check_threshold("scan", self.scan.threshold)?;
        check_threshold("person", self.person.threshold)?;

        for (what, value) in [
            ("store.collection", &self.store.collection),
            ("scan.label", &self.scan.label),
            ("scan.output_queue", &self.scan.output_queue),
            ("person.input_queue", &self.person.input_queue),
            ("person.label", &self.person.label),
            ("person.output_queue", &self.person.output_queue),
            ("extract.input_queue", &self.extract.input_queue),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Configuration(format!("{} cannot be empty", what)));
            }
        }

        if self.person.input_queue != self.scan.output_queue {
            return Err(Error::Configuration(format!(
                "person.input_queue '{}' must be scan.output_queue '{}'",
                self.person.input_queue, self.scan.output_queue
            )));
        }

        if self.extract.input_queue != self.person.output_queue {
            return Err(Error::Configuration(format!(
                "extract.input_queue '{}' must be person.output_queue '{}'",
                self.extract.input_queue, self.person.output_queue
            )));
        }

        if self.scan.output_queue == self.person.output_queue {
            return Err(Error::Configuration(
                "scan and person stages cannot share an output queue".to_string(),
            ));
        }

        if self.queue.wait_secs == 0 {
            return Err(Error::Configuration("queue.wait_secs must be greater than 0".to_string()));
        }

        if self.queue.visibility_timeout_secs == 0 {
            return Err(Error::Configuration(
                "queue.visibility_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.queue.poll_interval_ms == 0 {
            return Err(Error::Configuration(
                "queue.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if let DetectorConfig::Http { endpoint, .. } = &self.detector {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(Error::Configuration(format!(
                    "detector endpoint '{}' must be an http(s) URL",
                    endpoint
                )));
            }
        }

        Ok(())
    }
}

fn check_threshold(stage: &str, threshold: f32) -> Result<()> {
    if !threshold.is_finite() || !(0.0..=100.0).contains(&threshold) {
        return Err(Error::Configuration(format!(
            "{}.threshold must be between 0 and 100, got {}",
            stage, threshold
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.scan.label, "Car");
        assert_eq!(config.scan.threshold, 90.0);
        assert_eq!(config.scan.group(), "car_indexes");
        assert_eq!(config.person.input_queue, "car_indexes");
        assert_eq!(config.person.group(), "people_indexes");
        assert_eq!(config.extract.output_path, PathBuf::from("output.txt"));
        assert_eq!(config.queue.wait(), Duration::from_secs(20));
        assert_eq!(config.person.drain_polls, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = PipelineConfig::from_str(
            r#"
            log_level = "debug"

            [store]
            root = "/data/images"
            collection = "demo"

            [detector]
            kind = "fixture"
            path = "fixtures.json"

            [queue]
            wait_secs = 1

            [queue.backend]
            type = "memory"

            [scan]
            threshold = 75.5
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.store.collection, "demo");
        assert_eq!(
            config.detector,
            DetectorConfig::Fixture {
                path: PathBuf::from("fixtures.json")
            }
        );
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.queue.wait_secs, 1);
        assert_eq!(config.queue.visibility_timeout_secs, 30);
        assert_eq!(config.scan.threshold, 75.5);
        assert_eq!(config.scan.label, "Car");
    }

    #[test]
    fn test_config_from_json() {
        let config = PipelineConfig::from_str(
            r#"{"person": {"label": "Human", "drain_polls": 2},
                "detector": {"kind": "http", "endpoint": "https://detect.local"}}"#,
        )
        .unwrap();
        assert_eq!(config.person.label, "Human");
        assert_eq!(config.person.drain_polls, 2);
        match config.detector {
            DetectorConfig::Http { endpoint, upload_images, .. } => {
                assert_eq!(endpoint, "https://detect.local");
                assert!(!upload_images);
            }
            other => panic!("Expected http detector, got {:?}", other),
        }
    }

    #[test]
    fn test_config_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sifter.yaml");
        std::fs::write(
            &path,
            "extract:\n  output_path: /tmp/out.txt\nqueue:\n  backend:\n    type: spool\n    root: /tmp/spool\n",
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.extract.output_path, PathBuf::from("/tmp/out.txt"));
        assert_eq!(
            config.queue.backend,
            QueueBackend::Spool {
                root: PathBuf::from("/tmp/spool")
            }
        );
    }

    #[test]
    fn test_config_from_missing_file() {
        let result = PipelineConfig::from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_config_garbage_rejected() {
        assert!(PipelineConfig::from_str("[scan\nthreshold = ").is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("SIFTER_COLLECTION", "other-bucket"),
            ("SIFTER_FIXTURE_PATH", "/tmp/fixture.json"),
            ("SIFTER_QUEUE_ROOT", "/tmp/q"),
            ("SIFTER_OUTPUT_PATH", "/tmp/output.txt"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.store.collection, "other-bucket");
        assert_eq!(
            config.detector,
            DetectorConfig::Fixture {
                path: PathBuf::from("/tmp/fixture.json")
            }
        );
        assert_eq!(
            config.queue.backend,
            QueueBackend::Spool {
                root: PathBuf::from("/tmp/q")
            }
        );
        assert_eq!(config.extract.output_path, PathBuf::from("/tmp/output.txt"));
    }

    #[test]
    fn test_endpoint_override_keeps_api_key() {
        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| match key {
            "SIFTER_DETECTOR_API_KEY" => Some("secret".to_string()),
            _ => None,
        });
        config.apply_overrides(|key| match key {
            "SIFTER_DETECTOR_ENDPOINT" => Some("https://other".to_string()),
            _ => None,
        });

        match config.detector {
            DetectorConfig::Http { endpoint, api_key, .. } => {
                assert_eq!(endpoint, "https://other");
                assert_eq!(api_key.as_deref(), Some("secret"));
            }
            other => panic!("Expected http detector, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_threshold_range() {
        let mut config = PipelineConfig::default();
        config.scan.threshold = 100.5;
        assert!(config.validate().is_err());

        config.scan.threshold = -0.1;
        assert!(config.validate().is_err());

        config.scan.threshold = f32::NAN;
        assert!(config.validate().is_err());

        // Edge values are allowed
        config.scan.threshold = 0.0;
        config.person.threshold = 100.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_queue_chain() {
        let mut config = PipelineConfig::default();
        config.person.input_queue = "elsewhere".to_string();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.extract.input_queue = "car_indexes".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_durations() {
        let mut config = PipelineConfig::default();
        config.queue.wait_secs = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.queue.visibility_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_endpoint_scheme() {
        let mut config = PipelineConfig::default();
        config.detector = DetectorConfig::Http {
            endpoint: "ftp://nope".to_string(),
            api_key: None,
            request_timeout_secs: None,
            upload_images: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_group() {
        let mut config = PipelineConfig::default();
        config.scan.output_group = Some("cars".to_string());
        assert_eq!(config.scan.group(), "cars");
    }
}
