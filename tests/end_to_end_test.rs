// End-to-end runs of the three stages, each with its own clients, sharing a
// spool directory the way separate processes would.

use sifter_core::{DetectorConfig, PipelineConfig, QueueBackend};
use sifter_queue::WorkQueue;
use sifter_stage::{
    run_extract, run_person, run_pipeline, run_scan, RunMode, SinkMode, StageContext,
};
use std::path::Path;
use tempfile::TempDir;

const FIXTURE: &str = r#"{
  "items": {
    "A.jpg": {
      "labels": [{"name": "Car", "confidence": 95.0}, {"name": "Person", "confidence": 92.0}],
      "text": ["HWY", "101"]
    },
    "B.jpg": {
      "labels": [{"name": "Car", "confidence": 91.0}],
      "text": ["SHOULD", "NOT", "APPEAR"]
    },
    "C.jpg": {
      "labels": [{"name": "Car", "confidence": 80.0}, {"name": "Person", "confidence": 99.0}],
      "text": ["NOR", "THIS"]
    }
  }
}"#;

/// Image directory, fixture file and a config pointing at both
fn setup(dir: &Path) -> PipelineConfig {
    let bucket = dir.join("images").join("bucket");
    std::fs::create_dir_all(&bucket).unwrap();
    for name in ["A.jpg", "B.jpg", "C.jpg"] {
        std::fs::write(bucket.join(name), b"jpeg").unwrap();
    }
    let fixture = dir.join("fixture.json");
    std::fs::write(&fixture, FIXTURE).unwrap();

    let mut config = PipelineConfig::default();
    config.store.root = dir.join("images");
    config.store.collection = "bucket".to_string();
    config.detector = DetectorConfig::Fixture { path: fixture };
    config.queue.backend = QueueBackend::Spool {
        root: dir.join("spool"),
    };
    config.queue.wait_secs = 1;
    config.queue.poll_interval_ms = 20;
    config.extract.output_path = dir.join("output.txt");
    config
}

#[tokio::test]
async fn test_stages_in_sequence() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path());

    let scan = run_scan(&StageContext::from_config(config.clone()).unwrap(), RunMode::Fresh)
        .await
        .unwrap();
    assert_eq!(scan.seen, 3);
    assert_eq!(scan.forwarded, 2);

    let person = run_person(&StageContext::from_config(config.clone()).unwrap(), RunMode::Fresh)
        .await
        .unwrap();
    assert_eq!(person.seen, 2);
    assert_eq!(person.forwarded, 1);

    let extract = run_extract(
        &StageContext::from_config(config.clone()).unwrap(),
        SinkMode::Truncate,
    )
    .await
    .unwrap();
    assert_eq!(extract.records, 1);

    let output = std::fs::read_to_string(&config.extract.output_path).unwrap();
    assert_eq!(output, "A.jpg\tHWY 101\n");
}

#[tokio::test]
async fn test_stages_started_in_reverse_order() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path());

    // Downstream stages start first and wait on their queues
    let extract_config = config.clone();
    let extract = tokio::spawn(async move {
        let ctx = StageContext::from_config(extract_config).unwrap();
        run_extract(&ctx, SinkMode::Truncate).await
    });
    let person_config = config.clone();
    let person = tokio::spawn(async move {
        let ctx = StageContext::from_config(person_config).unwrap();
        run_person(&ctx, RunMode::Fresh).await
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    run_scan(&StageContext::from_config(config.clone()).unwrap(), RunMode::Fresh)
        .await
        .unwrap();

    assert_eq!(person.await.unwrap().unwrap().forwarded, 1);
    assert_eq!(extract.await.unwrap().unwrap().records, 1);

    let output = std::fs::read_to_string(&config.extract.output_path).unwrap();
    assert_eq!(output, "A.jpg\tHWY 101\n");
}

#[tokio::test]
async fn test_whole_pipeline_in_one_process() {
    let dir = TempDir::new().unwrap();
    let mut config = setup(dir.path());
    config.queue.backend = QueueBackend::Memory;

    let ctx = StageContext::from_config(config.clone()).unwrap();
    let report = run_pipeline(&ctx, RunMode::Fresh).await.unwrap();

    assert!(report.scan.sentinel_forwarded);
    assert!(report.person.sentinel_forwarded);
    assert_eq!(report.extract.records, 1);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["person"]["forwarded"], 1);

    let output = std::fs::read_to_string(&config.extract.output_path).unwrap();
    assert_eq!(output, "A.jpg\tHWY 101\n");
}

#[tokio::test]
async fn test_missing_collection_stops_before_downstream_sees_anything() {
    let dir = TempDir::new().unwrap();
    let mut config = setup(dir.path());
    config.store.collection = "absent".to_string();

    let ctx = StageContext::from_config(config.clone()).unwrap();
    assert!(run_scan(&ctx, RunMode::Fresh).await.is_err());

    let ctx = StageContext::from_config(config.clone()).unwrap();
    let queue = ctx.queue(&config.scan.output_queue).await.unwrap();
    assert!(queue.stats().await.unwrap().is_empty());
    ctx.close().await.unwrap();
}
