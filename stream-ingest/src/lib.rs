//! Streaming ingestion from a partitioned Kafka topic into model-ready batches.
//!
//! Partitions are split across the tasks of a distributed job, start offsets are resolved from
//! configuration or a restored checkpoint, and the highest consumed offset per partition is
//! tracked so it can be saved next to every model checkpoint.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`, full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`, full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source.

pub mod checkpoint;
pub mod config;
pub mod decode;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod offsets;
pub mod pipeline;
pub mod server;
pub mod service;

pub use error::{ConfigError, IngestError};
pub use kafka::types::{OffsetMap, PartitionId, PartitionOffset, Record};
pub use pipeline::{
    BatchReceiver, ModelBatch, PipelineConfig, PipelineHandle, StreamingBatchPipeline,
};
