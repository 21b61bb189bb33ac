//! Checkpoint Store - offset sidecar next to a training checkpoint
//!
//! The sidecar lives at `<checkpoint_path>.offset` and holds the offset map as a JSON object
//! keyed by stringified partition id. Writes land in a temporary sibling that is synced to disk
//! and then renamed over the sidecar, so readers see either the previous or the new map, never
//! a partial one, even after a crash.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::checkpoint::error::CheckpointError;
use crate::kafka::types::OffsetMap;
use crate::metrics_consts::{
    CHECKPOINT_RESTORE_DURATION, CHECKPOINT_RESTORES, CHECKPOINT_SAVES,
    CHECKPOINT_SAVE_DURATION,
};

pub const OFFSET_SIDECAR_SUFFIX: &str = ".offset";
const TEMP_SUFFIX: &str = ".tmp";

/// Sidecar path for `checkpoint_path`: the same path with `.offset` appended.
pub fn sidecar_path(checkpoint_path: &Path) -> PathBuf {
    let mut path = checkpoint_path.as_os_str().to_owned();
    path.push(OFFSET_SIDECAR_SUFFIX);
    PathBuf::from(path)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointStore;

impl CheckpointStore {
    pub fn new() -> Self {
        Self
    }

    /// Persist `offsets` for the checkpoint at `checkpoint_path`.
    ///
    /// Only the coordinating task calls this.
    pub async fn save(
        &self,
        checkpoint_path: &Path,
        offsets: &OffsetMap,
    ) -> Result<(), CheckpointError> {
        let start = Instant::now();
        let result = write_sidecar(checkpoint_path, offsets).await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(CHECKPOINT_SAVES, "outcome" => outcome).increment(1);
        metrics::histogram!(CHECKPOINT_SAVE_DURATION).record(start.elapsed().as_secs_f64());

        if result.is_ok() {
            info!(
                checkpoint = %checkpoint_path.display(),
                offsets = %offsets,
                "Saved checkpoint offsets"
            );
        }
        result
    }

    /// Read the offsets saved for `checkpoint_path`.
    ///
    /// A missing sidecar is not an error: a fresh model has no saved offsets yet.
    pub async fn restore(&self, checkpoint_path: &Path) -> Result<OffsetMap, CheckpointError> {
        let start = Instant::now();
        let result = read_sidecar(checkpoint_path).await;

        let outcome = match &result {
            Ok(Some(_)) => "restored",
            Ok(None) => "missing",
            Err(_) => "failure",
        };
        metrics::counter!(CHECKPOINT_RESTORES, "outcome" => outcome).increment(1);
        metrics::histogram!(CHECKPOINT_RESTORE_DURATION).record(start.elapsed().as_secs_f64());

        match result? {
            Some(offsets) => {
                info!(
                    checkpoint = %checkpoint_path.display(),
                    offsets = %offsets,
                    "Restored checkpoint offsets"
                );
                Ok(offsets)
            }
            None => {
                info!(
                    checkpoint = %checkpoint_path.display(),
                    "No offset sidecar for checkpoint, starting from resolved offsets"
                );
                Ok(OffsetMap::new())
            }
        }
    }

    /// Restore and merge into `offsets` with a per-partition max, so restored progress is
    /// never rewound by an earlier resolved start offset.
    pub async fn restore_into(
        &self,
        checkpoint_path: &Path,
        offsets: &mut OffsetMap,
    ) -> Result<(), CheckpointError> {
        let restored = self.restore(checkpoint_path).await?;
        for (partition, offset) in restored.iter() {
            if !offsets.contains(partition) {
                debug!(
                    partition = partition,
                    offset = offset,
                    "Restored offset for a partition not assigned to this task"
                );
            }
        }
        offsets.merge_max(&restored);
        Ok(())
    }
}

async fn write_sidecar(checkpoint_path: &Path, offsets: &OffsetMap) -> Result<(), CheckpointError> {
    let path = sidecar_path(checkpoint_path);
    let mut temp = path.clone().into_os_string();
    temp.push(TEMP_SUFFIX);
    let temp = PathBuf::from(temp);

    let json = serde_json::to_vec(offsets).map_err(|source| CheckpointError::Format {
        path: path.clone(),
        source,
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CheckpointError::io(parent, e))?;
    }

    if let Err(e) = write_synced(&temp, &json).await {
        remove_temp(&temp).await;
        return Err(CheckpointError::io(&temp, e));
    }

    if let Err(e) = tokio::fs::rename(&temp, &path).await {
        remove_temp(&temp).await;
        return Err(CheckpointError::io(&path, e));
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

async fn remove_temp(temp: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %temp.display(), error = %e, "Failed to remove temporary sidecar");
        }
    }
}

async fn read_sidecar(checkpoint_path: &Path) -> Result<Option<OffsetMap>, CheckpointError> {
    let path = sidecar_path(checkpoint_path);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CheckpointError::io(path, e)),
    };
    let offsets = serde_json::from_slice(&bytes)
        .map_err(|source| CheckpointError::Format { path, source })?;
    Ok(Some(offsets))
}
