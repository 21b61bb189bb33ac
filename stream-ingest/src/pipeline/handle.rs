use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::IngestError;
use crate::kafka::source::RecordStream;
use crate::kafka::types::OffsetMap;
use crate::offsets::{OffsetTracker, TaskAssignment};
use crate::pipeline::state::{PipelineState, StateCell};

pub(crate) type ConsumerTask = JoinHandle<Result<Option<Box<dyn RecordStream>>, IngestError>>;
type StageTask = JoinHandle<Result<(), IngestError>>;

/// Control surface of a running pipeline.
pub struct PipelineHandle {
    state: Arc<StateCell>,
    tracker: Arc<OffsetTracker>,
    store: CheckpointStore,
    assignment: TaskAssignment,
    cancel: CancellationToken,
    consumer: Option<ConsumerTask>,
    stages: Vec<(&'static str, StageTask)>,
    shutdown_timeout: Duration,
}

impl PipelineHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        state: Arc<StateCell>,
        tracker: Arc<OffsetTracker>,
        store: CheckpointStore,
        assignment: TaskAssignment,
        cancel: CancellationToken,
        consumer: ConsumerTask,
        stages: Vec<(&'static str, StageTask)>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            state,
            tracker,
            store,
            assignment,
            cancel,
            consumer: Some(consumer),
            stages,
            shutdown_timeout,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn assignment(&self) -> &TaskAssignment {
        &self.assignment
    }

    /// Current high-water marks.
    pub fn offsets(&self) -> OffsetMap {
        self.tracker.snapshot()
    }

    /// Stop pulling records. Downstream stages keep draining what was already consumed, and
    /// the batch receiver closes once they are done.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping record consumption");
            self.cancel.cancel();
        }
    }

    /// Save the current offsets next to `checkpoint_path`.
    ///
    /// Only the coordinating task writes; other tasks return `Ok(None)`. Consumption keeps
    /// running while the sidecar is written.
    pub async fn checkpoint(&self, checkpoint_path: &Path) -> Result<Option<OffsetMap>, IngestError> {
        if !self.assignment.is_coordinator() {
            debug!(
                checkpoint = %checkpoint_path.display(),
                "Not the coordinating task, skipping checkpoint offsets"
            );
            return Ok(None);
        }

        let entered = self
            .state
            .transition(PipelineState::Streaming, PipelineState::Checkpointing);
        let offsets = self.tracker.snapshot();
        let saved = self.store.save(checkpoint_path, &offsets).await;
        if entered {
            self.state
                .transition(PipelineState::Checkpointing, PipelineState::Streaming);
        }

        saved?;
        Ok(Some(offsets))
    }

    /// Cancel consumption, wait for every stage to finish (bounded by the shutdown timeout),
    /// then release the broker stream. Returns the first stage error, if any.
    pub async fn shutdown(&mut self) -> Result<(), IngestError> {
        self.cancel();
        let deadline = Instant::now() + self.shutdown_timeout;
        let mut first_error: Option<IngestError> = None;
        let mut stream: Option<Box<dyn RecordStream>> = None;

        if let Some(consumer) = self.consumer.take() {
            match join("consume", consumer, deadline).await {
                Some(Ok(returned)) => stream = returned,
                Some(Err(e)) => first_error = Some(e),
                None => {}
            }
        }

        for (name, task) in std::mem::take(&mut self.stages) {
            if let Some(Err(e)) = join(name, task, deadline).await {
                first_error.get_or_insert(e);
            }
        }

        drop(stream);
        self.state.set(PipelineState::Stopped);
        info!(offsets = %self.tracker.snapshot(), "Pipeline stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// `None` when the task panicked or did not finish before the deadline.
async fn join<T>(
    name: &'static str,
    mut task: JoinHandle<Result<T, IngestError>>,
    deadline: Instant,
) -> Option<Result<T, IngestError>> {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(result)) => Some(result),
        Ok(Err(e)) => {
            error!(stage = name, error = ?e, "Pipeline stage panicked");
            None
        }
        Err(_) => {
            warn!(stage = name, "Pipeline stage did not stop in time, aborting");
            task.abort();
            None
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
