// ==== Broker metrics ====
/// Counter for records pulled from the broker
pub const RECORDS_CONSUMED: &str = "stream_ingest_records_consumed_total";

/// Counter for broker errors, labelled by error type
pub const BROKER_ERRORS: &str = "stream_ingest_broker_errors_total";

/// Counter for retried broker operations, labelled by operation
pub const BROKER_RETRIES: &str = "stream_ingest_broker_retries_total";

// ==== Decode metrics ====
/// Counter for rows dropped because they failed to decode, labelled by error type
pub const DECODE_FAILURES: &str = "stream_ingest_decode_failures_total";

/// Counter for offset metadata tokens that could not be parsed
pub const MALFORMED_OFFSET_TOKENS: &str = "stream_ingest_malformed_offset_tokens_total";

// ==== Pipeline metrics ====
/// Counter for batches handed downstream
pub const BATCHES_EMITTED: &str = "stream_ingest_batches_emitted_total";

/// Histogram for rows per emitted batch
pub const BATCH_ROWS_HISTOGRAM: &str = "stream_ingest_batch_rows";

/// Gauge for the highest consumed offset per partition
pub const PARTITION_HIGH_WATER_MARK: &str = "stream_ingest_partition_high_water_mark";

/// Gauge for the pipeline state, one series per state set to 1 when active
pub const PIPELINE_STATE: &str = "stream_ingest_pipeline_state";

// ==== Checkpoint metrics ====
/// Counter for sidecar saves (outcome: success/failure)
pub const CHECKPOINT_SAVES: &str = "stream_ingest_checkpoint_saves_total";

/// Histogram for sidecar save duration
pub const CHECKPOINT_SAVE_DURATION: &str = "stream_ingest_checkpoint_save_duration_seconds";

/// Counter for sidecar restores (outcome: restored/missing/failure)
pub const CHECKPOINT_RESTORES: &str = "stream_ingest_checkpoint_restores_total";

/// Histogram for sidecar restore duration
pub const CHECKPOINT_RESTORE_DURATION: &str = "stream_ingest_checkpoint_restore_duration_seconds";
