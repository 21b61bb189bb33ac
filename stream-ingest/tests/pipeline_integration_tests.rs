use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use stream_ingest::checkpoint::{sidecar_path, CheckpointStore};
use stream_ingest::decode::{
    DecodeSchema, DelimitedDecoder, FieldValue, IdentityPreprocessor, Preprocessor, RecordDecoder,
};
use stream_ingest::kafka::types::Mode;
use stream_ingest::kafka::MemorySource;
use stream_ingest::offsets::OffsetConfig;
use stream_ingest::pipeline::{
    BatchReceiver, ModelBatch, PipelineConfig, PipelineState, StreamingBatchPipeline,
};
use stream_ingest::OffsetMap;

const TOPIC: &str = "events";

fn components(mode: Mode) -> (Arc<dyn RecordDecoder>, Arc<dyn Preprocessor>) {
    let fields = DecodeSchema::parse_fields("clk:int32,item:string").expect("valid fields");
    let schema = DecodeSchema::new(fields, &[], &["clk".to_string()], ',').expect("valid schema");
    (
        Arc::new(DelimitedDecoder::new(schema, mode.emits_labels())),
        Arc::new(IdentityPreprocessor),
    )
}

fn test_config(mode: Mode) -> PipelineConfig {
    let mut config = PipelineConfig::new(TOPIC, mode);
    config.batch_size = 2;
    config.num_parallel_calls = 2;
    config.prefetch_size = 4;
    config.poll_timeout = Duration::from_millis(20);
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

async fn receive_rows(rx: &mut BatchReceiver, rows: usize) -> Result<Vec<ModelBatch>> {
    let mut batches = Vec::new();
    let mut received = 0;
    while received < rows {
        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .context("timed out waiting for batches")?
            .context("batch channel closed early")?;
        received += batch.len();
        batches.push(batch);
    }
    Ok(batches)
}

#[tokio::test]
async fn test_stream_checkpoint_and_shutdown() -> Result<()> {
    let source = MemorySource::new().with_topic(TOPIC, 2);
    for i in 0..3 {
        source.produce(TOPIC, 0, &format!("1,item-{i}"));
    }
    for i in 0..2 {
        source.produce(TOPIC, 1, &format!("0,item-{i}"));
    }

    let (decoder, preprocessor) = components(Mode::Train);
    let pipeline = StreamingBatchPipeline::build(
        test_config(Mode::Train),
        Arc::new(source.clone()),
        decoder,
        preprocessor,
    )
    .await?;
    let (mut handle, mut rx) = pipeline.start().await?;
    assert_eq!(handle.state(), PipelineState::Streaming);

    let batches = receive_rows(&mut rx, 5).await?;
    assert!(batches.iter().all(|b| b.len() <= 2));
    assert!(batches.iter().all(|b| b.labels.is_some()));

    let mut seen = OffsetMap::new();
    for batch in &batches {
        seen.merge_max(&batch.offset_map());
        let labels = batch.labels.as_ref().expect("training batches carry labels");
        assert_eq!(labels.len(), batch.features.len());
        assert_eq!(batch.offsets.len(), batch.features.len());
    }
    let expected: OffsetMap = [(0, 2), (1, 1)].into_iter().collect();
    assert_eq!(seen, expected);
    assert_eq!(handle.offsets(), expected);

    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.ckpt-100");
    let saved = handle.checkpoint(&checkpoint).await?;
    assert_eq!(saved, Some(expected.clone()));
    assert!(sidecar_path(&checkpoint).exists());
    assert_eq!(handle.state(), PipelineState::Streaming);

    let restored = CheckpointStore::new().restore(&checkpoint).await?;
    assert_eq!(restored, expected);

    handle.cancel();
    while rx.recv().await.is_some() {}
    handle.shutdown().await?;
    assert_eq!(handle.state(), PipelineState::Stopped);

    Ok(())
}

#[tokio::test]
async fn test_records_arriving_after_start_are_consumed() -> Result<()> {
    let source = MemorySource::new().with_topic(TOPIC, 1);
    let (decoder, preprocessor) = components(Mode::Predict);
    let pipeline = StreamingBatchPipeline::build(
        test_config(Mode::Predict),
        Arc::new(source.clone()),
        decoder,
        preprocessor,
    )
    .await?;
    let (mut handle, mut rx) = pipeline.start().await?;

    source.produce(TOPIC, 0, "1,late");
    let batches = receive_rows(&mut rx, 1).await?;

    assert_eq!(batches[0].labels, None);
    assert_eq!(
        batches[0].features[0]["item"],
        FieldValue::String("late".to_string())
    );
    assert_eq!(handle.offsets().get(0), Some(0));

    handle.cancel();
    while rx.recv().await.is_some() {}
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_from_restored_offsets() -> Result<()> {
    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.ckpt-200");
    let saved: OffsetMap = [(0, 10), (1, 20)].into_iter().collect();
    CheckpointStore::new().save(&checkpoint, &saved).await?;

    let source = MemorySource::new().with_topic(TOPIC, 3);
    let (decoder, preprocessor) = components(Mode::Train);
    let mut config = test_config(Mode::Train);
    config.restore_from = Some(checkpoint);

    let pipeline =
        StreamingBatchPipeline::build(config, Arc::new(source), decoder, preprocessor).await?;

    let expected: OffsetMap = [(0, 10), (1, 20), (2, 0)].into_iter().collect();
    assert_eq!(pipeline.start_offsets(), &expected);
    assert_eq!(pipeline.tracker().snapshot(), expected);
    Ok(())
}

#[tokio::test]
async fn test_restored_offsets_never_rewind_explicit_offsets() -> Result<()> {
    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.ckpt-300");
    let saved: OffsetMap = [(0, 5), (1, 50)].into_iter().collect();
    CheckpointStore::new().save(&checkpoint, &saved).await?;

    let source = MemorySource::new().with_topic(TOPIC, 2);
    let (decoder, preprocessor) = components(Mode::Train);
    let mut config = test_config(Mode::Train);
    config.offset_config = OffsetConfig::parse(Some(r#"{"0": 30, "1": 40}"#))?;
    config.restore_from = Some(checkpoint);

    let pipeline =
        StreamingBatchPipeline::build(config, Arc::new(source), decoder, preprocessor).await?;

    let expected: OffsetMap = [(0, 30), (1, 50)].into_iter().collect();
    assert_eq!(pipeline.start_offsets(), &expected);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_sidecar_is_fatal_for_coordinator_only() -> Result<()> {
    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.ckpt-400");
    std::fs::write(sidecar_path(&checkpoint), b"not json")?;

    let source = Arc::new(MemorySource::new().with_topic(TOPIC, 2));

    let (decoder, preprocessor) = components(Mode::Train);
    let mut coordinator = test_config(Mode::Train);
    coordinator.task_num = 2;
    coordinator.restore_from = Some(checkpoint.clone());
    let result =
        StreamingBatchPipeline::build(coordinator, source.clone(), decoder, preprocessor).await;
    assert!(result.is_err());

    let (decoder, preprocessor) = components(Mode::Train);
    let mut worker = test_config(Mode::Train);
    worker.task_index = 1;
    worker.task_num = 2;
    worker.restore_from = Some(checkpoint);
    let pipeline = StreamingBatchPipeline::build(worker, source, decoder, preprocessor).await?;
    let expected: OffsetMap = [(1, 0)].into_iter().collect();
    assert_eq!(pipeline.start_offsets(), &expected);
    Ok(())
}

#[tokio::test]
async fn test_redundant_leader_coordinates_without_consuming() -> Result<()> {
    let source = Arc::new(MemorySource::new().with_topic(TOPIC, 4));
    source.produce(TOPIC, 0, "1,a");

    let (decoder, preprocessor) = components(Mode::Train);
    let mut leader = test_config(Mode::Train);
    leader.task_num = 3;
    leader.redundant_leader = true;
    let pipeline =
        StreamingBatchPipeline::build(leader, source.clone(), decoder, preprocessor).await?;
    assert!(pipeline.assignment().is_coordinator());
    assert!(!pipeline.assignment().is_consuming());

    let (mut handle, mut rx) = pipeline.start().await?;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "coordinator must not emit batches"
    );

    let dir = TempDir::new()?;
    let saved = handle.checkpoint(&dir.path().join("model.ckpt-1")).await?;
    assert_eq!(saved, Some(OffsetMap::new()));

    handle.cancel();
    assert!(rx.recv().await.is_none());
    handle.shutdown().await?;

    let (decoder, preprocessor) = components(Mode::Train);
    let mut worker = test_config(Mode::Train);
    worker.task_index = 2;
    worker.task_num = 3;
    worker.redundant_leader = true;
    let pipeline = StreamingBatchPipeline::build(worker, source, decoder, preprocessor).await?;
    assert_eq!(pipeline.assignment().partitions(), &[1, 3]);
    assert!(!pipeline.assignment().is_coordinator());
    Ok(())
}

#[tokio::test]
async fn test_worker_does_not_write_checkpoints() -> Result<()> {
    let source = MemorySource::new().with_topic(TOPIC, 2);
    let (decoder, preprocessor) = components(Mode::Train);
    let mut config = test_config(Mode::Train);
    config.task_index = 1;
    config.task_num = 2;

    let pipeline =
        StreamingBatchPipeline::build(config, Arc::new(source), decoder, preprocessor).await?;
    let (mut handle, mut rx) = pipeline.start().await?;

    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.ckpt-7");
    assert_eq!(handle.checkpoint(&checkpoint).await?, None);
    assert!(!sidecar_path(&checkpoint).exists());

    handle.cancel();
    while rx.recv().await.is_some() {}
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_covers_only_received_batches() -> Result<()> {
    let source = MemorySource::new().with_topic(TOPIC, 1);
    for i in 0..10 {
        source.produce(TOPIC, 0, &format!("1,item-{i}"));
    }

    let (decoder, preprocessor) = components(Mode::Train);
    let pipeline = StreamingBatchPipeline::build(
        test_config(Mode::Train),
        Arc::new(source),
        decoder,
        preprocessor,
    )
    .await?;
    let (mut handle, mut rx) = pipeline.start().await?;

    let first = receive_rows(&mut rx, 1).await?.remove(0);
    // give the stages time to fill their buffers with later records
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dir = TempDir::new()?;
    let checkpoint = dir.path().join("model.ckpt-500");
    let saved = handle.checkpoint(&checkpoint).await?;
    assert_eq!(saved.as_ref(), Some(&first.consumed));
    assert!(first.consumed.get(0) < Some(9));

    let second = receive_rows(&mut rx, 1).await?.remove(0);
    assert!(second.consumed.get(0) > first.consumed.get(0));
    assert_eq!(handle.offsets(), second.consumed);

    handle.cancel();
    while rx.recv().await.is_some() {}
    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_fatal_decode_error_does_not_advance_offsets() -> Result<()> {
    let source = MemorySource::new().with_topic(TOPIC, 1);
    source.produce(TOPIC, 0, "1,a");
    source.produce(TOPIC, 0, "1,b");
    source.produce(TOPIC, 0, ",c");

    let (decoder, preprocessor) = components(Mode::Train);
    let mut config = test_config(Mode::Train);
    config.batch_size = 3;
    let pipeline =
        StreamingBatchPipeline::build(config, Arc::new(source), decoder, preprocessor).await?;
    let (mut handle, mut rx) = pipeline.start().await?;

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert!(received.is_none());
    assert_eq!(handle.state(), PipelineState::Stopped);
    // the batch holding offsets 0 and 1 failed, so they were never handed out
    assert_eq!(handle.offsets().get(0), Some(0));

    assert!(handle.shutdown().await.is_err());
    Ok(())
}
