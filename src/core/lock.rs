//! Per-work-item exclusivity locks.
//!
//! A lock is a file `<locks_dir>/<work_item>.lock` created with
//! create-if-absent semantics and then held under an advisory exclusive
//! lock (`fs2`) for as long as the owner keeps the handle open. The OS drops
//! advisory locks when a process dies, so a lock file whose advisory lock
//! can be taken by someone else is stale and gets reclaimed.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::WorkItemId;

/// Attempts made before `acquire` gives up on a contended lock file
pub const LOCK_ACQUIRE_ATTEMPTS: u32 = 5;

const ACQUIRE_PAUSE: Duration = Duration::from_millis(50);

/// A lock file without a readable record younger than this is assumed to
/// be mid-creation rather than abandoned
const WRITE_GRACE: Duration = Duration::from_secs(2);

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub work_item: WorkItemId,

    /// Process id of the owner
    pub pid: u32,

    /// Random token identifying this acquisition
    pub token: Uuid,

    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

struct HeldLock {
    path: PathBuf,
    token: Uuid,
    /// Keeps the advisory lock alive
    file: File,
}

enum Inspection {
    /// Advisory lock is held by a live owner
    Held,
    /// Owner is gone. `file` still carries our advisory lock, which keeps
    /// other reclaimers off this file until we are done with it.
    Stale {
        record: Option<LockRecord>,
        file: File,
    },
    /// File is being written right now
    Settling,
    /// File disappeared between create and open
    Vanished,
}

/// Result of one acquisition attempt
enum Step {
    Acquired(HeldLock),
    Held,
    Settling,
    Retry,
}

/// Hands out and reclaims per-work-item locks
pub struct LockManager {
    dir: PathBuf,
    held: Mutex<HashMap<WorkItemId, HeldLock>>,
}

impl LockManager {
    /// Create a lock manager rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file for a work item
    pub fn lock_path(&self, work_item: &WorkItemId) -> PathBuf {
        self.dir.join(format!("{}.lock", work_item))
    }

    fn held(&self) -> MutexGuard<'_, HashMap<WorkItemId, HeldLock>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether this manager currently holds the lock
    pub fn is_held(&self, work_item: &WorkItemId) -> bool {
        self.held().contains_key(work_item)
    }

    /// Try to take the lock. Returns `false` when another live owner holds
    /// it; stale locks are reclaimed with a warning.
    pub async fn acquire(&self, work_item: &WorkItemId) -> Result<bool, LockError> {
        if self.is_held(work_item) {
            debug!(%work_item, "Lock already held by this process");
            return Ok(false);
        }

        let path = self.lock_path(work_item);

        for attempt in 1..=LOCK_ACQUIRE_ATTEMPTS {
            let dir = self.dir.clone();
            let target = path.clone();
            let id = work_item.clone();
            let step = tokio::task::spawn_blocking(move || {
                fs::create_dir_all(&dir).map_err(|e| LockError::io(&dir, e))?;
                acquire_step(&id, &target)
            })
            .await
            .map_err(|e| LockError::io(&path, io::Error::other(e)))??;

            match step {
                Step::Acquired(held) => {
                    info!(%work_item, token = %held.token, "Lock acquired");
                    self.held().insert(work_item.clone(), held);
                    return Ok(true);
                }
                Step::Held => {
                    debug!(%work_item, "Lock held by another owner");
                    return Ok(false);
                }
                Step::Settling => {
                    debug!(%work_item, attempt, "Lock file is being written, waiting");
                    tokio::time::sleep(ACQUIRE_PAUSE).await;
                }
                Step::Retry => {}
            }
        }

        debug!(%work_item, attempts = LOCK_ACQUIRE_ATTEMPTS, "Giving up on contended lock");
        Ok(false)
    }

    /// Release a lock held by this manager. Unknown, already released or
    /// foreign locks are ignored.
    pub fn release(&self, work_item: &WorkItemId) {
        let Some(held) = self.held().remove(work_item) else {
            debug!(%work_item, "Release of a lock this process does not hold, ignoring");
            return;
        };

        // Unlink before dropping the advisory lock: while we hold it nobody
        // can reclaim the file, so the path still names our file.
        match same_file(&held.file, &held.path) {
            Ok(true) => {
                if let Err(e) = fs::remove_file(&held.path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(%work_item, error = %e, "Failed to remove lock file");
                    }
                }
            }
            Ok(false) => warn!(%work_item, "Lock file was replaced while held, leaving it in place"),
            Err(e) => warn!(%work_item, error = %e, "Failed to check lock file"),
        }

        if let Err(e) = held.file.unlock() {
            debug!(%work_item, error = %e, "Failed to drop advisory lock explicitly");
        }
        info!(%work_item, token = %held.token, "Lock released");
    }

    /// Current lock record on disk, if any
    pub fn holder(&self, work_item: &WorkItemId) -> Option<LockRecord> {
        read_record(&self.lock_path(work_item))
    }

    /// Remove the lock file only if its owner is gone
    pub fn reclaim_if_stale(&self, work_item: &WorkItemId) -> Result<bool, LockError> {
        if self.is_held(work_item) {
            return Ok(false);
        }
        let path = self.lock_path(work_item);
        match inspect(&path)? {
            Inspection::Stale { file, .. } => {
                warn!(%work_item, "Reclaiming stale lock");
                reclaim(&path, &file)
            }
            Inspection::Held | Inspection::Settling | Inspection::Vanished => Ok(false),
        }
    }

    /// Remove the lock file regardless of owner (operator override)
    pub fn force_release(&self, work_item: &WorkItemId) -> Result<bool, LockError> {
        if self.is_held(work_item) {
            self.release(work_item);
            return Ok(true);
        }
        let path = self.lock_path(work_item);
        match fs::remove_file(&path) {
            Ok(()) => {
                warn!(%work_item, "Lock forcibly removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::io(&path, e)),
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        let ids: Vec<WorkItemId> = self.held().keys().cloned().collect();
        for id in ids {
            self.release(&id);
        }
    }
}

/// One blocking acquisition attempt: create, or inspect and reclaim
fn acquire_step(work_item: &WorkItemId, path: &Path) -> Result<Step, LockError> {
    if let Some(held) = try_create(work_item, path)? {
        return Ok(Step::Acquired(held));
    }

    match inspect(path)? {
        Inspection::Held => Ok(Step::Held),
        Inspection::Settling => Ok(Step::Settling),
        Inspection::Vanished => Ok(Step::Retry),
        Inspection::Stale { record, file } => {
            match &record {
                Some(record) => warn!(
                    %work_item,
                    owner_pid = record.pid,
                    acquired_at = %record.acquired_at,
                    "Reclaiming stale lock left by a dead process"
                ),
                None => warn!(%work_item, "Reclaiming stale lock without owner record"),
            }
            reclaim(path, &file)?;
            Ok(Step::Retry)
        }
    }
}

/// Exclusive create-if-absent. `None` when the file already exists or was
/// unlinked before we could lock it.
fn try_create(work_item: &WorkItemId, path: &Path) -> Result<Option<HeldLock>, LockError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(LockError::io(path, e)),
    };

    // An inspecting process may hold the advisory lock for a moment while it checks
    // the fresh file, so wait for it rather than fail.
    file.lock_exclusive().map_err(|e| LockError::io(path, e))?;

    if !same_file(&file, path).map_err(|e| LockError::io(path, e))? {
        debug!(path = %path.display(), "Lock file replaced before it was locked, retrying");
        return Ok(None);
    }

    let record = LockRecord {
        work_item: work_item.clone(),
        pid: std::process::id(),
        token: Uuid::new_v4(),
        acquired_at: Utc::now(),
    };
    let json = serde_json::to_vec(&record)
        .map_err(|e| LockError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
    file.write_all(&json)
        .and_then(|_| file.sync_all())
        .map_err(|e| LockError::io(path, e))?;

    Ok(Some(HeldLock {
        path: path.to_path_buf(),
        token: record.token,
        file,
    }))
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Check whether an existing lock file still has a live owner
fn inspect(path: &Path) -> Result<Inspection, LockError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Inspection::Vanished),
        Err(e) => return Err(LockError::io(path, e)),
    };

    if let Err(e) = file.try_lock_exclusive() {
        if e.kind() == fs2::lock_contended_error().kind() {
            return Ok(Inspection::Held);
        }
        return Err(LockError::io(path, e));
    }

    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| LockError::io(path, e))?;
    let record: Option<LockRecord> = serde_json::from_str(&content).ok();

    if record.is_none() {
        let age = file
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        if age < WRITE_GRACE {
            let _ = file.unlock();
            return Ok(Inspection::Settling);
        }
    }

    Ok(Inspection::Stale { record, file })
}

/// Unlink a stale lock file whose advisory lock the caller holds through
/// `file`. A path that no longer names that file is left alone.
fn reclaim(path: &Path, file: &File) -> Result<bool, LockError> {
    if !same_file(file, path).map_err(|e| LockError::io(path, e))? {
        debug!(path = %path.display(), "Lock file changed during reclaim, not removing");
        return Ok(false);
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LockError::io(path, e)),
    }
}

/// Whether `path` still names the open `file`
#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let open = file.metadata()?;
    match fs::metadata(path) {
        Ok(on_disk) => Ok(open.dev() == on_disk.dev() && open.ino() == on_disk.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Files that are open cannot be unlinked on this platform, so the path
/// names the file as long as it exists.
#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}
