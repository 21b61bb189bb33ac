pub mod assigner;
pub mod metadata;
pub mod resolver;
pub mod tracker;

pub use assigner::{assign, TaskAssignment, TaskRole};
pub use metadata::OffsetMetadata;
pub use resolver::{OffsetConfig, OffsetResolver};
pub use tracker::OffsetTracker;
