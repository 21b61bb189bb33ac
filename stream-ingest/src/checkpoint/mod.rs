pub mod error;
pub mod latest;
pub mod store;

pub use error::CheckpointError;
pub use latest::latest_checkpoint;
pub use store::{sidecar_path, CheckpointStore, OFFSET_SIDECAR_SUFFIX};
