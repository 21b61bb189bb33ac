//! Locate the most recent training checkpoint under a model directory.
//!
//! The training loop records its latest checkpoint in a `checkpoint` state file
//! (`model_checkpoint_path: "model.ckpt-1200"`). When that file is absent or unreadable the
//! directory is scanned for `model.ckpt-<step>.index` / `.meta` files and the largest step wins.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::checkpoint::error::CheckpointError;

pub const CHECKPOINT_STATE_FILE: &str = "checkpoint";
const CHECKPOINT_PREFIX: &str = "model.ckpt-";
const CHECKPOINT_SUFFIXES: [&str; 2] = [".index", ".meta"];
const STATE_KEY: &str = "model_checkpoint_path:";

/// Path prefix of the latest checkpoint in `model_dir`, or `None` for a fresh model.
pub async fn latest_checkpoint(model_dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    if let Some(path) = read_state_file(model_dir).await? {
        debug!(checkpoint = %path.display(), "Latest checkpoint from state file");
        return Ok(Some(path));
    }

    let mut entries = match tokio::fs::read_dir(model_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CheckpointError::io(model_dir, e)),
    };

    let mut latest: Option<u64> = None;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CheckpointError::io(model_dir, e))?
    {
        if let Some(step) = entry.file_name().to_str().and_then(parse_step) {
            latest = Some(latest.map_or(step, |current| current.max(step)));
        }
    }

    Ok(latest.map(|step| model_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))))
}

/// Step of a `model.ckpt-<step>.index` / `.meta` file name.
fn parse_step(file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(CHECKPOINT_PREFIX)?;
    CHECKPOINT_SUFFIXES
        .iter()
        .find_map(|suffix| rest.strip_suffix(suffix))
        .and_then(|step| step.parse().ok())
}

async fn read_state_file(model_dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    let state_path = model_dir.join(CHECKPOINT_STATE_FILE);
    let contents = match tokio::fs::read_to_string(&state_path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CheckpointError::io(state_path, e)),
    };

    let recorded = contents.lines().find_map(|line| {
        line.trim()
            .strip_prefix(STATE_KEY)
            .map(|value| value.trim().trim_matches('"').to_string())
    });

    match recorded {
        Some(path) if !path.is_empty() => {
            let path = PathBuf::from(path);
            Ok(Some(if path.is_absolute() {
                path
            } else {
                model_dir.join(path)
            }))
        }
        _ => {
            warn!(path = %state_path.display(), "Checkpoint state file has no model_checkpoint_path");
            Ok(None)
        }
    }
}
