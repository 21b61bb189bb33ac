//! Pipeline stages: consume -> decode -> preprocess.
//!
//! Stages are tokio tasks connected by bounded channels, so a slow consumer of model batches
//! holds back decoding, which in turn holds back broker polling. Decode and preprocess work
//! runs on the blocking pool with at most `parallelism` batches in flight per stage; results
//! leave each stage in the order the batches were consumed.
//!
//! Batches carry the offsets of every record consumed into them, including dropped rows. The
//! tracker only sees those offsets once the batch is handed out by `BatchReceiver`.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decode::{Preprocessor, RecordDecoder};
use crate::error::IngestError;
use crate::kafka::retry::RetryPolicy;
use crate::kafka::source::{BrokerError, RecordStream};
use crate::kafka::types::{OffsetMap, Record};
use crate::metrics_consts::{
    BATCHES_EMITTED, BATCH_ROWS_HISTOGRAM, BROKER_ERRORS, DECODE_FAILURES, RECORDS_CONSUMED,
};
use crate::offsets::OffsetMetadata;
use crate::pipeline::state::{PipelineState, StateCell};
use crate::pipeline::{ModelBatch, TaggedRow};

/// Decoded rows plus every record consumed for them.
pub(crate) struct DecodedBatch {
    pub rows: Vec<TaggedRow>,
    pub consumed: OffsetMap,
}

pub(crate) struct ConsumeSettings {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

/// Pull records into batches of `batch_size`. A partial batch is flushed when a poll times
/// out, and discarded on cancellation (its records were never observed).
///
/// Returns the stream so the caller can release it after downstream stages have drained.
pub(crate) async fn consume(
    mut stream: Box<dyn RecordStream>,
    settings: ConsumeSettings,
    tx: mpsc::Sender<Vec<Record>>,
    cancel: CancellationToken,
    state: Arc<StateCell>,
) -> Result<Box<dyn RecordStream>, IngestError> {
    let ConsumeSettings {
        batch_size,
        poll_timeout,
        retry_policy,
    } = settings;

    info!(batch_size = batch_size, "Starting record consumption");

    let mut batch: Vec<Record> = Vec::with_capacity(batch_size);
    let mut consecutive_failures: u32 = 0;

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => {
                info!(discarded = batch.len(), "Consumption cancelled");
                break;
            }
            polled = stream.poll(poll_timeout) => polled,
        };

        match polled {
            Ok(Some(record)) => {
                consecutive_failures = 0;
                metrics::counter!(RECORDS_CONSUMED).increment(1);
                batch.push(record);
                if batch.len() < batch_size {
                    continue;
                }
            }
            Ok(None) => {
                consecutive_failures = 0;
                if batch.is_empty() {
                    continue;
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                metrics::counter!(BROKER_ERRORS, "error" => e.error_type()).increment(1);

                if !e.is_retriable() {
                    error!(error = ?e, "Fatal broker error, stopping consumption");
                    state.set(PipelineState::Stopped);
                    return Err(e.into());
                }
                if retry_policy.exhausted(consecutive_failures) {
                    error!(
                        attempts = consecutive_failures,
                        error = ?e,
                        "Broker poll retries exhausted, stopping consumption"
                    );
                    state.set(PipelineState::Stopped);
                    return Err(BrokerError::RetriesExhausted {
                        operation: "poll",
                        attempts: consecutive_failures,
                        last: Box::new(e),
                    }
                    .into());
                }

                let backoff = retry_policy.retry_interval(consecutive_failures);
                warn!(
                    attempt = consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    error = ?e,
                    "Retriable broker error while polling"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                continue;
            }
        }

        let ready = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
        let discarded = ready.len();
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(discarded = discarded, "Consumption cancelled");
                break;
            }
            sent = tx.send(ready) => {
                if sent.is_err() {
                    debug!("Decode stage closed, stopping consumption");
                    break;
                }
            }
        }
    }

    Ok(stream)
}

/// Decode batches and attach per-row offset metadata. Rows that fail to decode are dropped; a
/// missing label stops the pipeline.
pub(crate) async fn decode(
    mut rx: mpsc::Receiver<Vec<Record>>,
    tx: mpsc::Sender<DecodedBatch>,
    decoder: Arc<dyn RecordDecoder>,
    parallelism: usize,
    cancel: CancellationToken,
    state: Arc<StateCell>,
) -> Result<(), IngestError> {
    let mut decoded = stream::poll_fn(move |cx| rx.poll_recv(cx))
        .map(|records| {
            let decoder = decoder.clone();
            tokio::task::spawn_blocking(move || decode_batch(records, decoder.as_ref()))
        })
        .buffered(parallelism.max(1));

    while let Some(joined) = decoded.next().await {
        let Some(result) = settle(joined) else {
            break;
        };
        let batch = match result {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = ?e, "Fatal decode error, stopping pipeline");
                state.set(PipelineState::Stopped);
                cancel.cancel();
                return Err(e);
            }
        };
        // forwarded even without rows so the consumed offsets still reach the tracker
        if tx.send(batch).await.is_err() {
            debug!("Preprocess stage closed, stopping decode");
            break;
        }
    }
    Ok(())
}

fn decode_batch(
    records: Vec<Record>,
    decoder: &dyn RecordDecoder,
) -> Result<DecodedBatch, IngestError> {
    let mut rows = Vec::with_capacity(records.len());
    let mut consumed = OffsetMap::new();
    for record in records {
        // consumed even when the record produces no row
        consumed.raise(record.partition, record.offset);
        match decoder.decode(&record) {
            Ok(row) => {
                let offsets = OffsetMetadata::single(record.partition, record.offset);
                rows.push(TaggedRow { row, offsets });
            }
            Err(e) if e.is_row_scoped() => {
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Dropping record that failed to decode"
                );
                metrics::counter!(DECODE_FAILURES, "error" => e.error_type()).increment(1);
            }
            Err(e) => {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Record cannot be decoded"
                );
                return Err(e.into());
            }
        }
    }
    Ok(DecodedBatch { rows, consumed })
}

/// Apply the preprocessor and split rows into model batches.
pub(crate) async fn preprocess(
    mut rx: mpsc::Receiver<DecodedBatch>,
    tx: mpsc::Sender<ModelBatch>,
    preprocessor: Arc<dyn Preprocessor>,
    emit_labels: bool,
    parallelism: usize,
    cancel: CancellationToken,
    state: Arc<StateCell>,
) -> Result<(), IngestError> {
    let mut processed = stream::poll_fn(move |cx| rx.poll_recv(cx))
        .map(|decoded| {
            let preprocessor = preprocessor.clone();
            tokio::task::spawn_blocking(move || {
                preprocess_batch(decoded, preprocessor.as_ref(), emit_labels)
            })
        })
        .buffered(parallelism.max(1));

    while let Some(joined) = processed.next().await {
        let Some(result) = settle(joined) else {
            break;
        };
        let batch = match result {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = ?e, "Fatal preprocessing error, stopping pipeline");
                state.set(PipelineState::Stopped);
                cancel.cancel();
                return Err(e);
            }
        };
        if !batch.is_empty() {
            metrics::counter!(BATCHES_EMITTED).increment(1);
            metrics::histogram!(BATCH_ROWS_HISTOGRAM).record(batch.len() as f64);
        }

        if tx.send(batch).await.is_err() {
            debug!("Model batch receiver dropped, stopping preprocess");
            break;
        }
    }
    Ok(())
}

fn preprocess_batch(
    decoded: DecodedBatch,
    preprocessor: &dyn Preprocessor,
    emit_labels: bool,
) -> Result<ModelBatch, IngestError> {
    let DecodedBatch { rows, consumed } = decoded;
    let mut processed = Vec::with_capacity(rows.len());
    for TaggedRow { row, offsets } in rows {
        match preprocessor.process(row) {
            Ok(row) => processed.push(TaggedRow { row, offsets }),
            Err(e) if e.is_row_scoped() => {
                warn!(offsets = %offsets, error = %e, "Dropping row that failed preprocessing");
                metrics::counter!(DECODE_FAILURES, "error" => e.error_type()).increment(1);
            }
            Err(e) => return Err(e.into()),
        }
    }
    let mut batch = ModelBatch::from_rows(processed, emit_labels);
    batch.consumed = consumed;
    Ok(batch)
}

// A panicking decoder is a bug, not a decode error: re-raise it on the stage task.
// `None` means the blocking task was cancelled by runtime shutdown.
fn settle<T>(joined: Result<T, JoinError>) -> Option<T> {
    match joined {
        Ok(value) => Some(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => None,
    }
}
