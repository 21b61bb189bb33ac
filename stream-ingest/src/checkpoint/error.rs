use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or writing the offset sidecar of a checkpoint.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint sidecar {path:?} is not a valid offset map")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}
