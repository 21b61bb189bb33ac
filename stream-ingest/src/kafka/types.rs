use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Partition id within a topic, in `[0, num_partitions)`.
pub type PartitionId = i32;

/// A single `partition:offset` coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionOffset {
    partition: PartitionId,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: PartitionId, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl fmt::Display for PartitionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.offset)
    }
}

/// Mapping of partition id to offset.
///
/// Depending on where it comes from this is either a start offset (resolver, restore) or the
/// last offset consumed (tracker snapshot). Serializes as a JSON object keyed by the
/// stringified partition id, which is also the checkpoint sidecar format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OffsetMap(BTreeMap<PartitionId, i64>);

impl OffsetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: PartitionId) -> Option<i64> {
        self.0.get(&partition).copied()
    }

    pub fn insert(&mut self, partition: PartitionId, offset: i64) -> Option<i64> {
        self.0.insert(partition, offset)
    }

    pub fn contains(&self, partition: PartitionId) -> bool {
        self.0.contains_key(&partition)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, i64)> + '_ {
        self.0.iter().map(|(p, o)| (*p, *o))
    }

    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.0.keys().copied()
    }

    /// Raise `partition` to `offset` unless it already holds a larger value.
    /// Returns true when the stored value changed.
    pub fn raise(&mut self, partition: PartitionId, offset: i64) -> bool {
        match self.0.get_mut(&partition) {
            Some(current) if *current >= offset => false,
            Some(current) => {
                *current = offset;
                true
            }
            None => {
                self.0.insert(partition, offset);
                true
            }
        }
    }

    /// Per-partition `max` merge of `other` into `self`. Never lowers an offset.
    pub fn merge_max(&mut self, other: &OffsetMap) {
        for (partition, offset) in other.iter() {
            self.raise(partition, offset);
        }
    }

    /// Keep only the given partitions.
    pub fn restricted_to(&self, partitions: &[PartitionId]) -> OffsetMap {
        self.iter()
            .filter(|(p, _)| partitions.contains(p))
            .collect()
    }
}

impl FromIterator<(PartitionId, i64)> for OffsetMap {
    fn from_iter<I: IntoIterator<Item = (PartitionId, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<PartitionId, i64>> for OffsetMap {
    fn from(map: BTreeMap<PartitionId, i64>) -> Self {
        Self(map)
    }
}

impl fmt::Display for OffsetMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(p, o)| format!("{p}:{o}")).collect();
        write!(f, "{{{}}}", parts.join(","))
    }
}

/// One message pulled from a partition of the topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition: PartitionId,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp: Option<SystemTime>,
}

impl Record {
    pub fn new(partition: PartitionId, offset: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: value.into(),
            timestamp: None,
        }
    }
}

/// Training/inference mode of the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

impl Mode {
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Train)
    }

    /// Labels are emitted for every mode except inference.
    pub fn emits_labels(&self) -> bool {
        !matches!(self, Mode::Predict)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Mode::Train),
            "eval" | "evaluate" => Ok(Mode::Eval),
            "predict" | "infer" => Ok(Mode::Predict),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Train => "train",
            Mode::Eval => "eval",
            Mode::Predict => "predict",
        };
        f.write_str(name)
    }
}
