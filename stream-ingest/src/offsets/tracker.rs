//! Offset Tracker - highest consumed offset per partition
//!
//! Marks are raised when a batch is handed to the training loop, and from the checkpoint
//! restore path at startup. Every update is a max reduction, so concurrent or repeated updates
//! in any order leave the same marks, and a mark never goes backwards.

use dashmap::DashMap;
use tracing::debug;

use crate::kafka::types::{OffsetMap, PartitionId};
use crate::metrics_consts::PARTITION_HIGH_WATER_MARK;

/// Thread-safe high-water marks, shared by all pipeline workers and the checkpoint path.
#[derive(Default)]
pub struct OffsetTracker {
    high_water: DashMap<PartitionId, i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from `offsets` (normally the effective start offsets), never lowering a mark
    /// that is already higher.
    pub fn seed(&self, offsets: &OffsetMap) {
        self.observe_all(offsets);
    }

    /// Record that `offset` of `partition` was consumed.
    ///
    /// The entry lock is held for the comparison, so concurrent observers cannot lose a
    /// higher value to a lower one.
    pub fn observe(&self, partition: PartitionId, offset: i64) {
        let mut advanced = false;
        self.high_water
            .entry(partition)
            .and_modify(|current| {
                if offset > *current {
                    *current = offset;
                    advanced = true;
                }
            })
            .or_insert_with(|| {
                advanced = true;
                offset
            });

        if advanced {
            metrics::gauge!(PARTITION_HIGH_WATER_MARK, "partition" => partition.to_string())
                .set(offset as f64);
        }
    }

    /// Observe every partition of `offsets`.
    pub fn observe_all(&self, offsets: &OffsetMap) {
        for (partition, offset) in offsets.iter() {
            self.observe(partition, offset);
        }
    }

    /// Copy of all marks.
    ///
    /// The map is read one shard at a time, so with concurrent observers this is not an atomic
    /// cut across partitions. Each partition's value is still a mark that was current at some
    /// point during the call and no lower than its value when the call started, because marks
    /// only ever rise. Saving such a copy never rewinds any partition.
    pub fn snapshot(&self) -> OffsetMap {
        let snapshot: OffsetMap = self
            .high_water
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        debug!(offsets = %snapshot, "Took offset tracker snapshot");
        snapshot
    }

    pub fn get(&self, partition: PartitionId) -> Option<i64> {
        self.high_water.get(&partition).map(|r| *r.value())
    }

    pub fn partition_count(&self) -> usize {
        self.high_water.len()
    }
}
