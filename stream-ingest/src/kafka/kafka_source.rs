//! rdkafka-backed `PartitionedSource`.
//!
//! Metadata and time-index lookups go through a short-lived `BaseConsumer` on the blocking
//! pool; record consumption uses a `StreamConsumer` with manual assignment, so there is no
//! consumer-group rebalancing and nothing is committed to the broker.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::kafka::retry::RetryPolicy;
use crate::kafka::source::{BrokerError, PartitionedSource, RecordStream};
use crate::kafka::types::{OffsetMap, PartitionId, Record};

#[derive(Clone)]
pub struct KafkaSource {
    config: ClientConfig,
    metadata_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl KafkaSource {
    /// Create a source from a client config built by `ConsumerConfigBuilder`.
    ///
    /// `metadata_timeout` bounds each metadata and offset lookup request; retriable failures
    /// are retried per `retry_policy`.
    pub fn new(config: ClientConfig, metadata_timeout: Duration, retry_policy: RetryPolicy) -> Self {
        Self {
            config,
            metadata_timeout,
            retry_policy,
        }
    }

    fn metadata_consumer(&self) -> Result<Arc<BaseConsumer>, BrokerError> {
        let consumer: BaseConsumer = self
            .config
            .create()
            .map_err(|e| BrokerError::kafka("create_consumer", e))?;
        Ok(Arc::new(consumer))
    }

    async fn fetch_partitions(&self, topic: &str) -> Result<Vec<PartitionId>, BrokerError> {
        let consumer = self.metadata_consumer()?;
        let topic_owned = topic.to_string();
        let timeout = self.metadata_timeout;

        let topic_state = tokio::task::spawn_blocking(move || {
            let metadata = consumer.fetch_metadata(Some(&topic_owned), timeout)?;
            let state = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic_owned)
                .map(|t| {
                    let partitions: Vec<PartitionId> =
                        t.partitions().iter().map(|p| p.id()).collect();
                    (t.error().map(RDKafkaErrorCode::from), partitions)
                });
            Ok::<_, KafkaError>(state)
        })
        .await
        .map_err(|e| BrokerError::Fatal(format!("metadata task failed: {e}")))?
        .map_err(|e| BrokerError::kafka("fetch_metadata", e))?;

        let (error, mut partitions) =
            topic_state.ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

        if let Some(code) = error {
            return Err(BrokerError::kafka(
                "fetch_metadata",
                KafkaError::MetadataFetch(code),
            ));
        }

        if partitions.is_empty() {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn fetch_offset_for_time(
        &self,
        topic: &str,
        partition: PartitionId,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, BrokerError> {
        let consumer = self.metadata_consumer()?;
        let timeout = self.metadata_timeout;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(timestamp_ms))
            .map_err(|e| BrokerError::kafka("offsets_for_times", e))?;

        let topic_owned = topic.to_string();
        tokio::task::spawn_blocking(move || {
            let resolved = consumer.offsets_for_times(tpl, timeout)?;
            let offset = resolved
                .find_partition(&topic_owned, partition)
                .and_then(|elem| match elem.offset() {
                    Offset::Offset(offset) if offset >= 0 => Some(offset),
                    _ => None,
                });
            Ok::<_, KafkaError>(offset)
        })
        .await
        .map_err(|e| BrokerError::Fatal(format!("offset lookup task failed: {e}")))?
        .map_err(|e| BrokerError::kafka("offsets_for_times", e))
    }
}

#[async_trait]
impl PartitionedSource for KafkaSource {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<PartitionId>, BrokerError> {
        self.retry_policy
            .retry("list_partitions", || self.fetch_partitions(topic))
            .await
    }

    async fn lookup_offset_for_timestamp(
        &self,
        topic: &str,
        partition: PartitionId,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, BrokerError> {
        self.retry_policy
            .retry("lookup_offset_for_timestamp", || {
                self.fetch_offset_for_time(topic, partition, timestamp_ms)
            })
            .await
    }

    async fn open(
        &self,
        topic: &str,
        start_offsets: &OffsetMap,
    ) -> Result<Box<dyn RecordStream>, BrokerError> {
        let consumer: StreamConsumer = self
            .config
            .create()
            .map_err(|e| BrokerError::kafka("create_consumer", e))?;

        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in start_offsets.iter() {
            tpl.add_partition_offset(topic, partition, Offset::Offset(offset))
                .map_err(|e| BrokerError::kafka("assign", e))?;
        }
        consumer
            .assign(&tpl)
            .map_err(|e| BrokerError::kafka("assign", e))?;

        info!(
            topic = topic,
            assignment = %start_offsets,
            "Assigned topic partitions to ingestion consumer"
        );

        Ok(Box::new(KafkaRecordStream { consumer }))
    }
}

struct KafkaRecordStream {
    consumer: StreamConsumer,
}

#[async_trait]
impl RecordStream for KafkaRecordStream {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, BrokerError> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(KafkaError::Canceled)) => return Err(BrokerError::Closed),
            Ok(Err(e)) => return Err(BrokerError::kafka("poll", e)),
            Ok(Ok(message)) => message,
        };

        let timestamp = message
            .timestamp()
            .to_millis()
            .filter(|ms| *ms >= 0)
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms as u64));

        let record = Record {
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            value: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
            timestamp,
        };
        debug!(
            partition = record.partition,
            offset = record.offset,
            "Received record"
        );
        Ok(Some(record))
    }
}
