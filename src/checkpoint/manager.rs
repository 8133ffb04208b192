use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::CheckpointError;

/// Checkpoint extension recognised when resuming from a directory.
pub const CHECKPOINT_EXTENSION: &str = "tar";

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to `path` via a sibling temporary file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}.tmp", file_name));
    fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;
    Ok(())
}

/// Resolve and create the per-job checkpoint directory under `root`, using the
/// scheduler's job and task ids from the environment.
pub fn preemptive_dir(root: &Path) -> Result<PathBuf, CheckpointError> {
    preemptive_dir_for(
        root,
        std::env::var("SLURM_JOB_ID").ok(),
        std::env::var("SLURM_PROCID").ok(),
    )
}

/// `{root}/{job_id}_{task_id}`. A missing job id falls back to a random UUID,
/// a missing task id to `0`.
pub fn preemptive_dir_for(
    root: &Path,
    job_id: Option<String>,
    task_id: Option<String>,
) -> Result<PathBuf, CheckpointError> {
    let job_id = job_id.unwrap_or_else(|| {
        tracing::warn!("preemption requested but no SLURM_JOB_ID is set; using a random job id");
        uuid::Uuid::new_v4().to_string()
    });
    let task_id = task_id.unwrap_or_else(|| "0".to_string());
    let dir = root.join(format!("{}_{}", job_id, task_id));
    fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
    Ok(dir)
}

fn creation_time(path: &Path) -> Result<SystemTime, CheckpointError> {
    let meta = fs::metadata(path).map_err(|e| io_error(path, e))?;
    meta.created()
        .or_else(|_| meta.modified())
        .map_err(|e| io_error(path, e))
}

/// The most recently created checkpoint file in `dir`, if any.
///
/// Ordering is by creation time (modification time on filesystems without
/// birth times), never by file name.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir).map_err(|e| io_error(dir, e))? {
        let path = entry.map_err(|e| io_error(dir, e))?.path();
        if !path.is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION)
        {
            continue;
        }
        let created = creation_time(&path)?;
        if latest.as_ref().map_or(true, |(t, _)| created > *t) {
            latest = Some((created, path));
        }
    }
    Ok(latest.map(|(_, p)| p))
}
