use crate::descriptor::{JobDescriptor, atomic_write};

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Contents of the completion marker file.
///
/// Written by the job script after the target program exits; a program may
/// write it itself to report a `result` path other than its output directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionMarker {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PathBuf>,
}

impl CompletionMarker {
    pub fn clean() -> Self {
        Self {
            exit_code: 0,
            result: None,
        }
    }

    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            result: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerStatus {
    Missing,
    /// The program exited cleanly. `result` is absolute.
    Clean { result: PathBuf },
    /// Non-zero exit, or a marker that could not be read as one.
    Unclean { reason: String },
}

/// Reads the completion marker of a job.
///
/// I/O errors other than a missing file are returned, the caller decides
/// whether to look again later.
pub async fn inspect_marker(descriptor: &JobDescriptor) -> std::io::Result<MarkerStatus> {
    let data = match fs::read(&descriptor.marker).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(MarkerStatus::Missing),
        Err(e) => return Err(e),
    };

    let status = match serde_json::from_slice::<CompletionMarker>(&data) {
        Ok(CompletionMarker { exit_code: 0, result }) => MarkerStatus::Clean {
            result: match result {
                Some(path) if path.is_absolute() => path,
                Some(path) => descriptor.workdir.join(path),
                None => descriptor.workdir.clone(),
            },
        },
        Ok(CompletionMarker { exit_code, .. }) => MarkerStatus::Unclean {
            reason: format!("Program exited with code {exit_code}"),
        },
        Err(e) => MarkerStatus::Unclean {
            reason: format!("Malformed completion marker: {e}"),
        },
    };
    Ok(status)
}

pub async fn write_marker(path: &Path, marker: &CompletionMarker) -> std::io::Result<()> {
    let data = serde_json::to_vec(marker)?;
    atomic_write(path, &data).await
}

/// Removes a marker left over from an earlier attempt.
pub async fn clear_marker(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
