use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::decode::DecodeError;
use crate::kafka::source::BrokerError;
use crate::kafka::types::PartitionId;

/// Fatal configuration problems, surfaced before streaming starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no partitions are assigned for this task ({task_index}/{task_num}, {num_partitions} partitions)")]
    EmptyAssignment {
        task_index: u32,
        task_num: u32,
        num_partitions: usize,
    },

    #[error("invalid offset config {raw:?}: {reason}")]
    InvalidOffsetConfig { raw: String, reason: String },

    #[error("no offset found at or after timestamp {timestamp}s for partition {partition}")]
    TimestampNotFound {
        partition: PartitionId,
        timestamp: i64,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Crate-level error taxonomy.
///
/// Configuration and broker errors abort the task's streaming loop; decode errors are row
/// scoped; checkpoint errors are fatal for the coordinating task only.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("configuration error")]
    Configuration(#[from] ConfigError),

    #[error("decode error")]
    Decode(#[from] DecodeError),

    #[error("broker error")]
    Broker(#[from] BrokerError),

    #[error("checkpoint error")]
    CheckpointIo(#[from] CheckpointError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_names_each_cause_once() {
        let err = anyhow::Error::from(IngestError::from(DecodeError::MissingLabel {
            field: "clk".to_string(),
        }));
        assert_eq!(format!("{err:#}"), "decode error: label field clk has no value");

        let err = anyhow::Error::from(IngestError::from(BrokerError::RetriesExhausted {
            operation: "poll",
            attempts: 3,
            last: Box::new(BrokerError::Unavailable("down".to_string())),
        }));
        assert_eq!(
            format!("{err:#}"),
            "broker error: poll failed after 3 attempts: broker unavailable: down"
        );
    }
}
