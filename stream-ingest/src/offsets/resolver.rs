//! Offset Resolver - starting offset per partition
//!
//! The offset config selects one of three mutually exclusive modes:
//! - `{"timestamp": <unix seconds>}`: ask the broker for the first offset at or after the
//!   timestamp. A partition with no such offset is a fatal configuration error.
//! - `{"<partition>": <offset>, ...}`: explicit offsets, unlisted partitions start at 0.
//! - no config: every partition starts at 0.

use std::sync::Arc;

use chrono::DateTime;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ConfigError, IngestError};
use crate::kafka::source::PartitionedSource;
use crate::kafka::types::{OffsetMap, PartitionId};

const TIMESTAMP_KEY: &str = "timestamp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetConfig {
    Default,
    /// Unix timestamp in seconds
    Timestamp(i64),
    Explicit(OffsetMap),
}

impl OffsetConfig {
    /// Parse the structured offset string. Blank input selects the default mode.
    pub fn parse(raw: Option<&str>) -> Result<Self, ConfigError> {
        let raw = match raw.map(str::trim) {
            None | Some("") => return Ok(OffsetConfig::Default),
            Some(raw) => raw,
        };
        let invalid = |reason: String| ConfigError::InvalidOffsetConfig {
            raw: raw.to_string(),
            reason,
        };

        let value: Value =
            serde_json::from_str(raw).map_err(|e| invalid(format!("not valid JSON: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| invalid("expected a JSON object".to_string()))?;

        if let Some(ts) = object.get(TIMESTAMP_KEY) {
            if object.len() > 1 {
                return Err(invalid(
                    "timestamp cannot be combined with explicit offsets".to_string(),
                ));
            }
            let ts = ts
                .as_i64()
                .filter(|ts| *ts >= 0)
                .ok_or_else(|| invalid("timestamp must be a non-negative integer".to_string()))?;
            // seconds, so the broker lookup in milliseconds cannot overflow
            if DateTime::from_timestamp(ts, 0).is_none() {
                return Err(invalid(format!("timestamp {ts} is out of range")));
            }
            return Ok(OffsetConfig::Timestamp(ts));
        }

        let mut offsets = OffsetMap::new();
        for (key, offset) in object {
            let partition: PartitionId = key
                .trim()
                .parse()
                .ok()
                .filter(|p: &PartitionId| *p >= 0)
                .ok_or_else(|| invalid(format!("partition id {key:?} is not a valid partition")))?;
            let offset = offset
                .as_i64()
                .filter(|o| *o >= 0)
                .ok_or_else(|| {
                    invalid(format!("offset for partition {key} must be a non-negative integer"))
                })?;
            offsets.insert(partition, offset);
        }
        Ok(OffsetConfig::Explicit(offsets))
    }
}

pub struct OffsetResolver {
    source: Arc<dyn PartitionedSource>,
}

impl OffsetResolver {
    pub fn new(source: Arc<dyn PartitionedSource>) -> Self {
        Self { source }
    }

    /// Compute the start offset of every partition in `partitions`.
    ///
    /// Deterministic for identical inputs; the only side effects are the broker lookups of
    /// timestamp mode.
    pub async fn resolve(
        &self,
        topic: &str,
        partitions: &[PartitionId],
        config: &OffsetConfig,
    ) -> Result<OffsetMap, IngestError> {
        let resolved = match config {
            OffsetConfig::Default => partitions.iter().map(|p| (*p, 0)).collect(),

            OffsetConfig::Explicit(explicit) => {
                for partition in explicit.partitions() {
                    if !partitions.contains(&partition) {
                        warn!(
                            topic = topic,
                            partition = partition,
                            "Ignoring configured offset for unknown partition"
                        );
                    }
                }
                partitions
                    .iter()
                    .map(|p| (*p, explicit.get(*p).unwrap_or(0)))
                    .collect()
            }

            OffsetConfig::Timestamp(timestamp) => {
                let timestamp_ms = timestamp.saturating_mul(1000);
                let mut resolved = OffsetMap::new();
                for partition in partitions {
                    let offset = self
                        .source
                        .lookup_offset_for_timestamp(topic, *partition, timestamp_ms)
                        .await?
                        .ok_or(ConfigError::TimestampNotFound {
                            partition: *partition,
                            timestamp: *timestamp,
                        })?;
                    info!(
                        topic = topic,
                        partition = partition,
                        timestamp = timestamp,
                        at = %DateTime::from_timestamp(*timestamp, 0).unwrap_or_default(),
                        offset = offset,
                        "Found offset by time"
                    );
                    resolved.insert(*partition, offset);
                }
                resolved
            }
        };

        Ok(resolved)
    }
}
