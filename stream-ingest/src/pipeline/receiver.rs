use std::sync::Arc;

use tokio::sync::mpsc;

use crate::offsets::OffsetTracker;
use crate::pipeline::ModelBatch;

/// Receiving end of the pipeline.
///
/// A batch's consumed offsets reach the tracker when the batch is received, never earlier.
/// Batches still buffered inside the pipeline are therefore absent from any checkpoint.
pub struct BatchReceiver {
    rx: mpsc::Receiver<ModelBatch>,
    tracker: Arc<OffsetTracker>,
}

impl BatchReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<ModelBatch>, tracker: Arc<OffsetTracker>) -> Self {
        Self { rx, tracker }
    }

    /// Next batch with at least one row, or `None` once the pipeline has drained.
    ///
    /// Batches whose records were all dropped only advance the tracker. Cancel safe: a batch
    /// with rows is observed and returned in the same poll.
    pub async fn recv(&mut self) -> Option<ModelBatch> {
        loop {
            let batch = self.rx.recv().await?;
            self.tracker.observe_all(&batch.consumed);
            if !batch.is_empty() {
                return Some(batch);
            }
        }
    }
}
