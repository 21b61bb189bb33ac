//! Per-row offset metadata.
//!
//! Each output row carries the `partition:offset` coordinates of the records that produced
//! it. Inside the pipeline the metadata travels as a structured value next to the row; the
//! text form (`"0:10,2:5"`, comma or newline separated) is used when rows leave the process
//! or come back from an external preprocessing step.

use std::fmt;

use tracing::warn;

use crate::decode::DecodeError;
use crate::kafka::types::{OffsetMap, PartitionId, PartitionOffset};
use crate::metrics_consts::MALFORMED_OFFSET_TOKENS;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMetadata {
    coordinates: Vec<PartitionOffset>,
}

impl OffsetMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(partition: PartitionId, offset: i64) -> Self {
        Self {
            coordinates: vec![PartitionOffset::new(partition, offset)],
        }
    }

    pub fn push(&mut self, coordinate: PartitionOffset) {
        self.coordinates.push(coordinate);
    }

    pub fn iter(&self) -> impl Iterator<Item = PartitionOffset> + '_ {
        self.coordinates.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    /// Highest offset per partition among the coordinates.
    pub fn to_offset_map(&self) -> OffsetMap {
        let mut map = OffsetMap::new();
        for coordinate in &self.coordinates {
            map.raise(coordinate.partition(), coordinate.offset());
        }
        map
    }

    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Parse the text form. Malformed tokens are skipped with a warning and never fail the
    /// row; blank tokens are ignored silently.
    pub fn parse(raw: &str) -> Self {
        let mut metadata = OffsetMetadata::new();
        for token in raw.split([',', '\n']).map(str::trim).filter(|t| !t.is_empty()) {
            match parse_token(token) {
                Ok(coordinate) => metadata.push(coordinate),
                Err(e) => {
                    warn!(token = token, error = %e, "Skipping malformed offset metadata token");
                    metrics::counter!(MALFORMED_OFFSET_TOKENS).increment(1);
                }
            }
        }
        metadata
    }
}

/// Parse one `partition:offset` token.
pub fn parse_token(token: &str) -> Result<PartitionOffset, DecodeError> {
    let malformed = || DecodeError::MalformedOffsetToken(token.to_string());

    let (partition, offset) = token.split_once(':').ok_or_else(malformed)?;
    let partition: PartitionId = partition.trim().parse().map_err(|_| malformed())?;
    let offset: i64 = offset.trim().parse().map_err(|_| malformed())?;
    if partition < 0 || offset < 0 {
        return Err(malformed());
    }
    Ok(PartitionOffset::new(partition, offset))
}

impl fmt::Display for OffsetMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, coordinate) in self.coordinates.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{coordinate}")?;
        }
        Ok(())
    }
}

impl FromIterator<PartitionOffset> for OffsetMetadata {
    fn from_iter<I: IntoIterator<Item = PartitionOffset>>(iter: I) -> Self {
        Self {
            coordinates: iter.into_iter().collect(),
        }
    }
}

impl From<&OffsetMap> for OffsetMetadata {
    fn from(map: &OffsetMap) -> Self {
        map.iter().map(|(p, o)| PartitionOffset::new(p, o)).collect()
    }
}
