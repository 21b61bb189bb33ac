//! In-memory `PartitionedSource` used for dry runs and tests.
//!
//! Records are appended per partition and can keep arriving while a stream is open. Opened
//! streams deliver partitions round-robin, each in offset order, starting at the requested
//! start offsets.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::kafka::source::{BrokerError, PartitionedSource, RecordStream};
use crate::kafka::types::{OffsetMap, PartitionId, Record};

#[derive(Default)]
struct Topic {
    partitions: BTreeMap<PartitionId, Vec<Record>>,
}

#[derive(Default)]
struct Inner {
    topics: BTreeMap<String, Topic>,
    // errors returned by the next polls of any open stream, in order
    injected_poll_errors: VecDeque<BrokerError>,
}

#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `topic` with `num_partitions` empty partitions.
    pub fn with_topic(self, topic: &str, num_partitions: i32) -> Self {
        {
            let mut inner = self.lock();
            let entry = inner.topics.entry(topic.to_string()).or_default();
            for partition in 0..num_partitions {
                entry.partitions.entry(partition).or_default();
            }
        }
        self
    }

    /// Append a record; its offset is the partition's next offset. Returns that offset.
    pub fn produce(&self, topic: &str, partition: PartitionId, value: &str) -> i64 {
        self.produce_at(topic, partition, value, SystemTime::now())
    }

    /// Append a record with an explicit timestamp. Returns its offset.
    pub fn produce_at(
        &self,
        topic: &str,
        partition: PartitionId,
        value: &str,
        timestamp: SystemTime,
    ) -> i64 {
        let mut inner = self.lock();
        let records = inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .partitions
            .entry(partition)
            .or_default();
        let offset = records.len() as i64;
        records.push(Record {
            partition,
            offset,
            key: None,
            value: value.as_bytes().to_vec(),
            timestamp: Some(timestamp),
        });
        offset
    }

    /// Make the next poll on any open stream fail with `error`.
    pub fn inject_poll_error(&self, error: BrokerError) {
        self.lock().injected_poll_errors.push_back(error);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned lock only means a test panicked mid-update; the data is still usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn millis_since_epoch(ts: SystemTime) -> i64 {
    ts.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl PartitionedSource for MemorySource {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<PartitionId>, BrokerError> {
        let inner = self.lock();
        let topic = inner
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        Ok(topic.partitions.keys().copied().collect())
    }

    async fn lookup_offset_for_timestamp(
        &self,
        topic: &str,
        partition: PartitionId,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, BrokerError> {
        let inner = self.lock();
        let records = inner
            .topics
            .get(topic)
            .and_then(|t| t.partitions.get(&partition))
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

        Ok(records
            .iter()
            .find(|r| {
                r.timestamp
                    .map(|ts| millis_since_epoch(ts) >= timestamp_ms)
                    .unwrap_or(false)
            })
            .map(|r| r.offset))
    }

    async fn open(
        &self,
        topic: &str,
        start_offsets: &OffsetMap,
    ) -> Result<Box<dyn RecordStream>, BrokerError> {
        if !self.lock().topics.contains_key(topic) {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }
        Ok(Box::new(MemoryRecordStream {
            source: self.clone(),
            topic: topic.to_string(),
            positions: start_offsets.iter().collect(),
            cursor: 0,
        }))
    }
}

struct MemoryRecordStream {
    source: MemorySource,
    topic: String,
    positions: Vec<(PartitionId, i64)>,
    cursor: usize,
}

impl MemoryRecordStream {
    fn next_available(&mut self) -> Result<Option<Record>, BrokerError> {
        let mut inner = self.source.lock();
        if let Some(err) = inner.injected_poll_errors.pop_front() {
            return Err(err);
        }
        let topic = inner.topics.get(&self.topic).ok_or(BrokerError::Closed)?;

        for step in 0..self.positions.len() {
            let idx = (self.cursor + step) % self.positions.len();
            let (partition, next_offset) = self.positions[idx];
            let record = topic
                .partitions
                .get(&partition)
                .and_then(|records| usize::try_from(next_offset).ok().and_then(|i| records.get(i)));

            if let Some(record) = record {
                self.positions[idx].1 = next_offset + 1;
                self.cursor = idx + 1;
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RecordStream for MemoryRecordStream {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.next_available()? {
                return Ok(Some(record));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(std::cmp::min(deadline - now, Duration::from_millis(5))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_starts_at_requested_offsets() {
        let source = MemorySource::new().with_topic("events", 2);
        for i in 0..3 {
            source.produce("events", 0, &format!("p0-{i}"));
            source.produce("events", 1, &format!("p1-{i}"));
        }

        let start: OffsetMap = [(0, 2), (1, 0)].into_iter().collect();
        let mut stream = source.open("events", &start).await.unwrap();

        let mut seen = Vec::new();
        while let Some(record) = stream.poll(Duration::from_millis(10)).await.unwrap() {
            seen.push((record.partition, record.offset));
        }

        assert_eq!(seen.len(), 4);
        assert!(seen.contains(&(0, 2)));
        assert!(!seen.contains(&(0, 1)));
        assert!(seen.contains(&(1, 0)));
        assert!(seen.contains(&(1, 2)));
    }

    #[tokio::test]
    async fn test_timestamp_lookup() {
        let source = MemorySource::new().with_topic("events", 1);
        let base = UNIX_EPOCH + Duration::from_secs(1_000);
        source.produce_at("events", 0, "a", base);
        source.produce_at("events", 0, "b", base + Duration::from_secs(10));

        let found = source
            .lookup_offset_for_timestamp("events", 0, 1_005_000)
            .await
            .unwrap();
        assert_eq!(found, Some(1));

        let missing = source
            .lookup_offset_for_timestamp("events", 0, 2_000_000)
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let source = MemorySource::new();
        assert!(matches!(
            source.list_partitions("missing").await,
            Err(BrokerError::UnknownTopic(_))
        ));
    }
}
