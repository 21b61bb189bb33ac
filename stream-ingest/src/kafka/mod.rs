pub mod config;
pub mod kafka_source;
pub mod memory_source;
pub mod retry;
pub mod source;
pub mod types;

pub use kafka_source::KafkaSource;
pub use memory_source::MemorySource;
pub use source::{BrokerError, PartitionedSource, RecordStream};
