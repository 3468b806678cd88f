//! Durable per-work-item orchestration state.
//!
//! One JSON document per work item at `<state_dir>/<id>.json`. Writes go to
//! a temp file in the same directory which is fsynced and renamed over the
//! target, so a reader sees either the old or the new record, never a torn
//! one.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{OrchestrationState, WorkItemId};

/// Persisted state exists but cannot be trusted
#[derive(Debug, Error)]
#[error("state file {path} is corrupt: {reason}")]
pub struct StateCorruptionError {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Corrupt(#[from] StateCorruptionError),

    #[error("state I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StateError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// File-backed store for `OrchestrationState`
///
/// Clones share one write gate. A save whose caller is cancelled keeps the
/// gate until its blocking write finishes, so [`StateStore::settle`] returns
/// only once every started write has landed.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    writes: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state file for a work item
    pub fn state_path(&self, work_item: &WorkItemId) -> PathBuf {
        self.dir.join(format!("{}.json", work_item))
    }

    /// Load persisted state. `None` when nothing has been saved yet.
    pub async fn load(&self, work_item: &WorkItemId) -> Result<Option<OrchestrationState>, StateError> {
        let path = self.state_path(work_item);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(&path, e)),
        };

        let corrupt = |reason: String| StateCorruptionError {
            path: path.clone(),
            reason,
        };

        let state: OrchestrationState =
            serde_json::from_str(&content).map_err(|e| corrupt(format!("invalid JSON: {}", e)))?;

        if &state.work_item != work_item {
            return Err(corrupt(format!(
                "file belongs to work item '{}', expected '{}'",
                state.work_item, work_item
            ))
            .into());
        }
        state.validate().map_err(corrupt)?;

        debug!(%work_item, status = state.status.label(), "State loaded");
        Ok(Some(state))
    }

    /// Persist state atomically
    pub async fn save(&self, state: &OrchestrationState) -> Result<(), StateError> {
        let path = self.state_path(&state.work_item);
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| StateError::io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let gate = Arc::clone(&self.writes).lock_owned().await;
        let dir = self.dir.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || {
            let _gate = gate;
            write_atomic(&dir, &target, &json)
        })
            .await
            .map_err(|e| StateError::io(&path, io::Error::new(io::ErrorKind::Other, e)))?
            .map_err(|e| StateError::io(&path, e))?;

        debug!(
            work_item = %state.work_item,
            status = state.status.label(),
            current_stage = ?state.current_stage,
            "State saved"
        );
        Ok(())
    }

    /// Wait for in-flight saves, including ones whose callers were dropped
    pub async fn settle(&self) {
        let _ = self.writes.lock().await;
    }

    /// Delete persisted state. Returns whether a file was removed.
    pub async fn remove(&self, work_item: &WorkItemId) -> Result<bool, StateError> {
        let path = self.state_path(work_item);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }

    /// Work items with persisted state, sorted
    pub async fn list(&self) -> Result<Vec<WorkItemId>, StateError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&self.dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match WorkItemId::new(stem) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring stray state file"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Write `bytes` to `target` via a synced temp file in `dir`
pub(crate) fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}
