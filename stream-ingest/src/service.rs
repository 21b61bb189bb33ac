use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::checkpoint::latest_checkpoint;
use crate::config::Config;
use crate::decode::{DelimitedDecoder, IdentityPreprocessor, Preprocessor, RecordDecoder};
use crate::kafka::kafka_source::KafkaSource;
use crate::kafka::source::PartitionedSource;
use crate::pipeline::{ModelBatch, PipelineHandle, StreamingBatchPipeline};

/// Boundary to the training loop: receives every model batch in consumption order.
///
/// Offsets are only ever saved next to checkpoints the sink reports, at the point it reports
/// them. The service never writes next to a checkpoint it did not see being created.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Train on `batch`. Returns the path of a model checkpoint written after this batch, if
    /// one was.
    async fn consume(&self, batch: ModelBatch) -> Result<Option<PathBuf>>;

    /// Called once after the last batch of a clean shutdown. Returns the path of a final
    /// checkpoint, if one was written.
    async fn finish(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Sink used by the standalone binary: logs batch statistics and drops the rows. It trains
/// nothing, so it never reports a checkpoint.
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl BatchSink for LoggingSink {
    async fn consume(&self, batch: ModelBatch) -> Result<Option<PathBuf>> {
        debug!(
            rows = batch.len(),
            offsets = %batch.offset_map(),
            "Received model batch"
        );
        Ok(None)
    }
}

pub struct IngestService {
    config: Config,
    source: Arc<dyn PartitionedSource>,
    decoder: Arc<dyn RecordDecoder>,
    preprocessor: Arc<dyn Preprocessor>,
    sink: Arc<dyn BatchSink>,
}

impl IngestService {
    /// Wire the Kafka source, delimited decoder and logging sink from `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let client_config = config
            .consumer_config()
            .context("Invalid kafka client options")?;
        let source = KafkaSource::new(client_config, config.metadata_timeout(), config.retry_policy());
        let decoder = DelimitedDecoder::new(
            config.decode_schema()?,
            config.parsed_mode()?.emits_labels(),
        );

        Ok(Self::with_components(
            config,
            Arc::new(source),
            Arc::new(decoder),
            Arc::new(IdentityPreprocessor),
            Arc::new(LoggingSink),
        ))
    }

    pub fn with_components(
        config: Config,
        source: Arc<dyn PartitionedSource>,
        decoder: Arc<dyn RecordDecoder>,
        preprocessor: Arc<dyn Preprocessor>,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        Self {
            config,
            source,
            decoder,
            preprocessor,
            sink,
        }
    }

    /// Run until ctrl+c.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = ?e, "Failed to listen for ctrl+c, shutting down");
            }
        })
        .await
    }

    /// Run until `shutdown_signal` resolves or the pipeline stops on its own.
    ///
    /// On shutdown consumption stops first and batches already consumed are still delivered
    /// to the sink. If every stage stopped cleanly the sink may then report a final
    /// checkpoint, which the coordinating task saves offsets for.
    pub async fn run_with_shutdown(self, shutdown_signal: impl Future<Output = ()>) -> Result<()> {
        let restore_from = self.restore_path().await?;
        let pipeline_config = self.config.to_pipeline_config(restore_from)?;

        let pipeline = StreamingBatchPipeline::build(
            pipeline_config,
            self.source.clone(),
            self.decoder.clone(),
            self.preprocessor.clone(),
        )
        .await
        .context("Failed to build ingestion pipeline")?;

        let (mut handle, mut batches) = pipeline
            .start()
            .await
            .context("Failed to start ingestion pipeline")?;
        info!("Stream ingestion service started");

        tokio::pin!(shutdown_signal);
        let mut stopping = false;
        let mut failure: Option<anyhow::Error> = None;

        loop {
            tokio::select! {
                _ = &mut shutdown_signal, if !stopping => {
                    info!("Received shutdown signal, shutting down gracefully...");
                    stopping = true;
                    handle.cancel();
                }

                batch = batches.recv() => {
                    let Some(batch) = batch else {
                        break;
                    };
                    if failure.is_some() {
                        continue;
                    }
                    let delivered = match self.sink.consume(batch).await {
                        Ok(Some(checkpoint)) => self.save_checkpoint(&handle, &checkpoint).await,
                        Ok(None) => Ok(()),
                        Err(e) => Err(e.context("Batch sink failed")),
                    };
                    if let Err(e) = delivered {
                        error!(error = ?e, "Stopping pipeline");
                        failure = Some(e);
                        stopping = true;
                        handle.cancel();
                    }
                }
            }
        }

        let stopped = handle.shutdown().await;
        info!(offsets = %handle.offsets(), "Stream ingestion service stopped");

        if let Some(e) = failure {
            return Err(e);
        }
        // a stage error means consumed records may never have reached the sink
        stopped.context("Ingestion pipeline stopped with an error")?;

        if let Some(checkpoint) = self.sink.finish().await.context("Batch sink failed to finish")? {
            self.save_checkpoint(&handle, &checkpoint).await?;
        }
        Ok(())
    }

    /// Checkpoint to restore offsets from: `CHECKPOINT_PATH`, else the latest checkpoint in
    /// `MODEL_DIR`.
    async fn restore_path(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = self.config.checkpoint_path_buf() {
            return Ok(Some(path));
        }
        match self.config.model_dir_buf() {
            Some(model_dir) => latest_checkpoint(&model_dir)
                .await
                .with_context(|| format!("Failed to look up latest checkpoint in {model_dir:?}")),
            None => Ok(None),
        }
    }

    async fn save_checkpoint(&self, handle: &PipelineHandle, checkpoint: &Path) -> Result<()> {
        if let Some(offsets) = handle
            .checkpoint(checkpoint)
            .await
            .with_context(|| format!("Failed to save offsets for checkpoint {checkpoint:?}"))?
        {
            info!(
                checkpoint = %checkpoint.display(),
                offsets = %offsets,
                "Saved checkpoint offsets"
            );
        }
        Ok(())
    }
}
