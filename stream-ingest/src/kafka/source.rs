use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::kafka::types::{OffsetMap, PartitionId, Record};

/// Errors surfaced by a broker client.
///
/// Retriable errors are retried with backoff at the client boundary and only escalate once
/// the configured retry budget is exhausted.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Kafka returned an error during an operation
    #[error("kafka error during {operation}")]
    Kafka {
        operation: &'static str,
        #[source]
        source: KafkaError,
    },

    /// Broker could not be reached (transient)
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Topic is unknown to the broker
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Non-recoverable client failure
    #[error("fatal broker error: {0}")]
    Fatal(String),

    /// A retriable error persisted past the retry budget
    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<BrokerError>,
    },

    /// The record stream was closed (shutdown or client dropped)
    #[error("record stream closed")]
    Closed,
}

impl BrokerError {
    pub fn kafka(operation: &'static str, source: KafkaError) -> Self {
        BrokerError::Kafka { operation, source }
    }

    /// Returns true if the operation may succeed when retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            BrokerError::Unavailable(_) => true,
            BrokerError::Kafka { source, .. } => is_retriable_kafka_error(source),
            BrokerError::UnknownTopic(_)
            | BrokerError::Fatal(_)
            | BrokerError::RetriesExhausted { .. }
            | BrokerError::Closed => false,
        }
    }

    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            BrokerError::Kafka { .. } => "kafka",
            BrokerError::Unavailable(_) => "unavailable",
            BrokerError::UnknownTopic(_) => "unknown_topic",
            BrokerError::Fatal(_) => "fatal",
            BrokerError::RetriesExhausted { .. } => "retries_exhausted",
            BrokerError::Closed => "closed",
        }
    }
}

// Connection and timeout problems heal on their own; authentication and fatal consumption
// errors never do.
fn is_retriable_kafka_error(e: &KafkaError) -> bool {
    match e {
        KafkaError::MessageConsumption(code)
        | KafkaError::Global(code)
        | KafkaError::MetadataFetch(code)
        | KafkaError::OffsetFetch(code) => !matches!(
            code,
            RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::Fatal
        ),
        KafkaError::MessageConsumptionFatal(_) | KafkaError::Canceled => false,
        KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..) => false,
        _ => true,
    }
}

/// An ordered stream of records from the assigned partitions.
///
/// Records from a single partition arrive in non-decreasing offset order; there is no
/// ordering across partitions and no end-of-stream signal.
#[async_trait]
pub trait RecordStream: Send {
    /// Wait up to `timeout` for the next record. `Ok(None)` means nothing arrived in time.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, BrokerError>;
}

/// Capability interface of an ingestion backend.
///
/// Implemented by the Kafka client and the in-memory source; the streaming pipeline is
/// composed with a source rather than specialized per backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PartitionedSource: Send + Sync {
    /// All partition ids of `topic`.
    async fn list_partitions(&self, topic: &str) -> Result<Vec<PartitionId>, BrokerError>;

    /// First offset whose record timestamp is at or after `timestamp_ms`, if any.
    async fn lookup_offset_for_timestamp(
        &self,
        topic: &str,
        partition: PartitionId,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, BrokerError>;

    /// Start consuming `topic` from the given per-partition start offsets.
    async fn open(
        &self,
        topic: &str,
        start_offsets: &OffsetMap,
    ) -> Result<Box<dyn RecordStream>, BrokerError>;
}
