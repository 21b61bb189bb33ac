//! Streaming Batch Pipeline
//!
//! Construction assigns partitions, resolves start offsets and merges restored checkpoint
//! offsets (`Configured -> Assigned`). Starting it spawns the consume, decode and preprocess
//! stages (`Streaming`) and hands back a `PipelineHandle` plus the receiver of model batches.
//!
//! Offsets count as consumed once their batch is received, so a checkpoint taken between two
//! batches covers exactly what the training loop has been given.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::decode::{DecodedRow, FieldMap, Preprocessor, RecordDecoder};
use crate::error::{ConfigError, IngestError};
use crate::kafka::retry::RetryPolicy;
use crate::kafka::source::PartitionedSource;
use crate::kafka::types::{Mode, OffsetMap, PartitionId};
use crate::offsets::{
    assign, OffsetConfig, OffsetMetadata, OffsetResolver, OffsetTracker, TaskAssignment,
};

pub mod handle;
pub mod receiver;
pub(crate) mod stages;
pub mod state;

pub use handle::PipelineHandle;
pub use receiver::BatchReceiver;
pub use state::PipelineState;

use handle::ConsumerTask;
use stages::ConsumeSettings;
use state::StateCell;

/// Everything a task needs to build its pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub topic: String,
    pub task_index: u32,
    pub task_num: u32,
    /// In training, task 0 coordinates and consumes nothing.
    pub redundant_leader: bool,
    pub mode: Mode,
    pub offset_config: OffsetConfig,
    /// Checkpoint whose offset sidecar is merged into the start offsets.
    pub restore_from: Option<PathBuf>,
    pub batch_size: usize,
    pub num_parallel_calls: usize,
    pub prefetch_size: usize,
    pub poll_timeout: Duration,
    /// Budget for consecutive failed polls before the stream is abandoned.
    pub poll_retry_policy: RetryPolicy,
    pub shutdown_timeout: Duration,
}

impl PipelineConfig {
    pub fn new(topic: &str, mode: Mode) -> Self {
        Self {
            topic: topic.to_string(),
            task_index: 0,
            task_num: 1,
            redundant_leader: false,
            mode,
            offset_config: OffsetConfig::Default,
            restore_from: None,
            batch_size: 32,
            num_parallel_calls: 4,
            prefetch_size: 32,
            poll_timeout: Duration::from_millis(100),
            poll_retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(reason.to_string()));
        if self.topic.trim().is_empty() {
            return invalid("topic must not be empty");
        }
        if self.task_num == 0 || self.task_index >= self.task_num {
            return Err(ConfigError::Invalid(format!(
                "task index {} is out of range for {} tasks",
                self.task_index, self.task_num
            )));
        }
        if self.batch_size == 0 {
            return invalid("batch size must be positive");
        }
        if self.num_parallel_calls == 0 {
            return invalid("parallelism must be positive");
        }
        if self.prefetch_size == 0 {
            return invalid("prefetch size must be positive");
        }
        Ok(())
    }
}

/// A decoded row with the coordinates of the records that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedRow {
    pub row: DecodedRow,
    pub offsets: OffsetMetadata,
}

/// Model input handed to the training loop. `labels` is `None` in predict mode; otherwise
/// `features`, `labels` and `offsets` line up row by row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelBatch {
    pub features: Vec<FieldMap>,
    pub labels: Option<Vec<FieldMap>>,
    pub offsets: Vec<OffsetMetadata>,
    /// Highest offset per partition of every record consumed for this batch, including
    /// records that were dropped.
    pub consumed: OffsetMap,
}

impl ModelBatch {
    pub fn from_rows(rows: Vec<TaggedRow>, emit_labels: bool) -> Self {
        let mut features = Vec::with_capacity(rows.len());
        let mut labels = emit_labels.then(|| Vec::with_capacity(rows.len()));
        let mut offsets = Vec::with_capacity(rows.len());

        let mut consumed = OffsetMap::new();

        for TaggedRow { row, offsets: metadata } in rows {
            features.push(row.features);
            if let Some(labels) = labels.as_mut() {
                labels.push(row.labels.unwrap_or_default());
            }
            consumed.merge_max(&metadata.to_offset_map());
            offsets.push(metadata);
        }

        Self {
            features,
            labels,
            offsets,
            consumed,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Highest offset per partition among the rows of this batch.
    pub fn offset_map(&self) -> OffsetMap {
        let mut map = OffsetMap::new();
        for metadata in &self.offsets {
            map.merge_max(&metadata.to_offset_map());
        }
        map
    }
}

pub struct StreamingBatchPipeline {
    config: PipelineConfig,
    source: Arc<dyn PartitionedSource>,
    decoder: Arc<dyn RecordDecoder>,
    preprocessor: Arc<dyn Preprocessor>,
    store: CheckpointStore,
    state: Arc<StateCell>,
    assignment: TaskAssignment,
    start_offsets: OffsetMap,
    tracker: Arc<OffsetTracker>,
}

impl StreamingBatchPipeline {
    /// Assign partitions, resolve start offsets and merge restored checkpoint offsets.
    ///
    /// Restore failures are fatal for the coordinating task; other tasks fall back to the
    /// resolved offsets.
    pub async fn build(
        config: PipelineConfig,
        source: Arc<dyn PartitionedSource>,
        decoder: Arc<dyn RecordDecoder>,
        preprocessor: Arc<dyn Preprocessor>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        let state = Arc::new(StateCell::new());
        let store = CheckpointStore::new();

        let partitions = source.list_partitions(&config.topic).await?;
        let num_partitions = partitions.len();
        if let Some(p) = partitions
            .iter()
            .find(|p| **p < 0 || **p as usize >= num_partitions)
        {
            warn!(
                topic = %config.topic,
                partition = p,
                num_partitions = num_partitions,
                "Topic partition ids are not contiguous"
            );
        }

        let assignment = assign(
            num_partitions,
            config.task_index,
            config.task_num,
            config.redundant_leader,
            config.mode.is_training(),
        )?;

        let resolver = OffsetResolver::new(source.clone());
        let mut start_offsets = resolver
            .resolve(&config.topic, assignment.partitions(), &config.offset_config)
            .await?;

        if let Some(checkpoint) = &config.restore_from {
            match store.restore_into(checkpoint, &mut start_offsets).await {
                Ok(()) => {}
                Err(e) if !assignment.is_coordinator() => {
                    warn!(
                        checkpoint = %checkpoint.display(),
                        error = ?e,
                        "Failed to restore checkpoint offsets, continuing with resolved offsets"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        let tracker = Arc::new(OffsetTracker::new());
        tracker.seed(&start_offsets);
        state.set(PipelineState::Assigned);

        info!(
            topic = %config.topic,
            task_index = config.task_index,
            task_num = config.task_num,
            mode = %config.mode,
            partitions = ?assignment.partitions(),
            start_offsets = %start_offsets,
            "Pipeline assigned"
        );

        Ok(Self {
            config,
            source,
            decoder,
            preprocessor,
            store,
            state,
            assignment,
            start_offsets,
            tracker,
        })
    }

    pub fn assignment(&self) -> &TaskAssignment {
        &self.assignment
    }

    /// Effective start offsets: resolved offsets merged with restored ones. May include
    /// restored partitions this task does not consume.
    pub fn start_offsets(&self) -> &OffsetMap {
        &self.start_offsets
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn tracker(&self) -> Arc<OffsetTracker> {
        self.tracker.clone()
    }

    /// Open the record stream and spawn the pipeline stages.
    pub async fn start(self) -> Result<(PipelineHandle, BatchReceiver), IngestError> {
        let prefetch = self.config.prefetch_size;
        let cancel = CancellationToken::new();
        let (raw_tx, raw_rx) = mpsc::channel(prefetch);
        let (decoded_tx, decoded_rx) = mpsc::channel(prefetch);
        let (out_tx, out_rx) = mpsc::channel(prefetch);

        let consumed: Vec<PartitionId> = self.assignment.partitions().to_vec();
        let consumer: ConsumerTask = if consumed.is_empty() {
            info!("Task consumes no partitions, pipeline idles until shutdown");
            let cancel = cancel.clone();
            tokio::spawn(async move {
                // holding the sender keeps the batch receiver open
                let _raw_tx = raw_tx;
                cancel.cancelled().await;
                Ok(None)
            })
        } else {
            let stream_offsets = self.start_offsets.restricted_to(&consumed);
            let stream = self.source.open(&self.config.topic, &stream_offsets).await?;
            let settings = ConsumeSettings {
                batch_size: self.config.batch_size,
                poll_timeout: self.config.poll_timeout,
                retry_policy: self.config.poll_retry_policy.clone(),
            };
            let consume =
                stages::consume(stream, settings, raw_tx, cancel.clone(), self.state.clone());
            tokio::spawn(async move { consume.await.map(Some) })
        };

        let decode = tokio::spawn(stages::decode(
            raw_rx,
            decoded_tx,
            self.decoder.clone(),
            self.config.num_parallel_calls,
            cancel.clone(),
            self.state.clone(),
        ));
        let preprocess = tokio::spawn(stages::preprocess(
            decoded_rx,
            out_tx,
            self.preprocessor.clone(),
            self.config.mode.emits_labels(),
            self.config.num_parallel_calls,
            cancel.clone(),
            self.state.clone(),
        ));

        self.state.set(PipelineState::Streaming);

        let batches = BatchReceiver::new(out_rx, self.tracker.clone());
        let handle = PipelineHandle::new(
            self.state,
            self.tracker,
            self.store,
            self.assignment,
            cancel,
            consumer,
            vec![("decode", decode), ("preprocess", preprocess)],
            self.config.shutdown_timeout,
        );
        Ok((handle, batches))
    }
}
