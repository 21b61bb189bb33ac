use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use envconfig::Envconfig;
use tempfile::TempDir;
use tokio::sync::Notify;

use stream_ingest::checkpoint::{sidecar_path, CheckpointStore};
use stream_ingest::config::Config;
use stream_ingest::decode::{DelimitedDecoder, IdentityPreprocessor};
use stream_ingest::kafka::MemorySource;
use stream_ingest::service::{BatchSink, IngestService};
use stream_ingest::{ModelBatch, OffsetMap};

const TOPIC: &str = "events";

/// Stands in for a training loop: counts rows, wakes the test once `expected` rows have
/// arrived and reports checkpoints when configured to.
#[derive(Default)]
struct TrainerSink {
    rows: Mutex<usize>,
    expected: usize,
    done: Arc<Notify>,
    // reported by the batch that reaches `expected` rows
    checkpoint_at_expected: Option<PathBuf>,
    // reported when the service finishes
    final_checkpoint: Option<PathBuf>,
}

impl TrainerSink {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            ..Default::default()
        }
    }

    fn checkpoint_at_expected(mut self, path: PathBuf) -> Self {
        self.checkpoint_at_expected = Some(path);
        self
    }

    fn final_checkpoint(mut self, path: PathBuf) -> Self {
        self.final_checkpoint = Some(path);
        self
    }

    fn rows(&self) -> usize {
        *self.rows.lock().unwrap()
    }
}

#[async_trait]
impl BatchSink for TrainerSink {
    async fn consume(&self, batch: ModelBatch) -> Result<Option<PathBuf>> {
        let mut rows = self.rows.lock().unwrap();
        let before = *rows;
        *rows += batch.len();
        if before < self.expected && *rows >= self.expected {
            self.done.notify_one();
            return Ok(self.checkpoint_at_expected.clone());
        }
        Ok(None)
    }

    async fn finish(&self) -> Result<Option<PathBuf>> {
        Ok(self.final_checkpoint.clone())
    }
}

struct FailingSink;

#[async_trait]
impl BatchSink for FailingSink {
    async fn consume(&self, _batch: ModelBatch) -> Result<Option<PathBuf>> {
        bail!("trainer went away")
    }
}

fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut env: HashMap<String, String> = [
        ("KAFKA_TOPIC", TOPIC),
        ("INPUT_FIELDS", "clk:int32,item:string"),
        ("LABEL_FIELDS", "clk"),
        ("BATCH_SIZE", "2"),
        ("NUM_PARALLEL_CALLS", "2"),
        ("PREFETCH_SIZE", "4"),
        ("POLL_TIMEOUT_MS", "20"),
        ("SHUTDOWN_TIMEOUT_SECS", "5"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (key, value) in overrides {
        env.insert(key.to_string(), value.to_string());
    }
    Config::init_from_hashmap(&env).unwrap()
}

fn service(config: Config, source: MemorySource, sink: Arc<dyn BatchSink>) -> IngestService {
    let decoder = DelimitedDecoder::new(config.decode_schema().unwrap(), true);
    IngestService::with_components(
        config,
        Arc::new(source),
        Arc::new(decoder),
        Arc::new(IdentityPreprocessor),
        sink,
    )
}

async fn run_until_done(service: IngestService, done: Arc<Notify>) -> Result<()> {
    tokio::time::timeout(
        Duration::from_secs(10),
        service.run_with_shutdown(async move { done.notified().await }),
    )
    .await?
}

fn two_partition_source() -> MemorySource {
    let source = MemorySource::new().with_topic(TOPIC, 2);
    for i in 0..3 {
        source.produce(TOPIC, 0, &format!("1,a{i}"));
        source.produce(TOPIC, 1, &format!("0,b{i}"));
    }
    source
}

#[tokio::test]
async fn test_offsets_saved_when_sink_reports_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.ckpt-10");

    let sink = Arc::new(TrainerSink::new(6).checkpoint_at_expected(checkpoint.clone()));
    let done = sink.done.clone();
    let service = service(test_config(&[]), two_partition_source(), sink.clone());

    run_until_done(service, done).await?;

    assert_eq!(sink.rows(), 6);
    let saved = CheckpointStore::new().restore(&checkpoint).await?;
    let expected: OffsetMap = [(0, 2), (1, 2)].into_iter().collect();
    assert_eq!(saved, expected);
    Ok(())
}

#[tokio::test]
async fn test_final_checkpoint_saved_after_clean_shutdown() -> Result<()> {
    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.ckpt-11");

    let sink = Arc::new(TrainerSink::new(6).final_checkpoint(checkpoint.clone()));
    let done = sink.done.clone();
    let service = service(test_config(&[]), two_partition_source(), sink.clone());

    run_until_done(service, done).await?;

    let saved = CheckpointStore::new().restore(&checkpoint).await?;
    let expected: OffsetMap = [(0, 2), (1, 2)].into_iter().collect();
    assert_eq!(saved, expected);
    Ok(())
}

#[tokio::test]
async fn test_restart_continues_from_saved_offsets() -> Result<()> {
    let dir = TempDir::new()?;
    let restored = dir.path().join("model.ckpt-20");
    let saved: OffsetMap = [(0, 4)].into_iter().collect();
    CheckpointStore::new().save(&restored, &saved).await?;

    let source = MemorySource::new().with_topic(TOPIC, 1);
    for i in 0..6 {
        source.produce(TOPIC, 0, &format!("1,a{i}"));
    }

    // offsets 4 and 5 are replayed from the restored position
    let next = dir.path().join("model.ckpt-21");
    let sink = Arc::new(TrainerSink::new(2).final_checkpoint(next.clone()));
    let done = sink.done.clone();
    let config = test_config(&[("CHECKPOINT_PATH", restored.to_str().unwrap())]);

    run_until_done(service(config, source, sink.clone()), done).await?;

    assert_eq!(sink.rows(), 2);
    let store = CheckpointStore::new();
    assert_eq!(store.restore(&next).await?.get(0), Some(5));
    assert_eq!(store.restore(&restored).await?, saved);
    Ok(())
}

#[tokio::test]
async fn test_existing_model_dir_checkpoint_is_not_rewritten() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("model.ckpt-1.index"), b"")?;
    let existing = dir.path().join("model.ckpt-1");

    let sink = Arc::new(TrainerSink::new(6));
    let done = sink.done.clone();
    let config = test_config(&[("MODEL_DIR", dir.path().to_str().unwrap())]);

    run_until_done(service(config, two_partition_source(), sink.clone()), done).await?;

    assert_eq!(sink.rows(), 6);
    assert!(!sidecar_path(&existing).exists());
    Ok(())
}

#[tokio::test]
async fn test_sink_failure_stops_the_service() -> Result<()> {
    let source = MemorySource::new().with_topic(TOPIC, 1);
    source.produce(TOPIC, 0, "1,a");

    let service = service(test_config(&[]), source, Arc::new(FailingSink));

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        service.run_with_shutdown(std::future::pending()),
    )
    .await?;

    let err = result.expect_err("sink failure must stop the service");
    assert!(format!("{err:#}").contains("trainer went away"));
    Ok(())
}

#[tokio::test]
async fn test_fatal_decode_error_skips_final_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.ckpt-40");

    let source = MemorySource::new().with_topic(TOPIC, 1);
    source.produce(TOPIC, 0, "1,a");
    source.produce(TOPIC, 0, "1,b");
    source.produce(TOPIC, 0, ",c");

    let sink = Arc::new(TrainerSink::new(3).final_checkpoint(checkpoint.clone()));
    let config = test_config(&[("BATCH_SIZE", "3")]);
    let service = service(config, source, sink.clone());

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        service.run_with_shutdown(std::future::pending()),
    )
    .await?;

    let err = result.expect_err("a missing label must stop the service");
    assert!(format!("{err:#}").contains("decode error"));
    assert_eq!(sink.rows(), 0);
    assert!(!sidecar_path(&checkpoint).exists());
    Ok(())
}
