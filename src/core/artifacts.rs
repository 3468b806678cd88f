//! Artifact detection for skip decisions.
//!
//! Detection is fail-open: anything that prevents a clean answer is logged
//! and treated as "no artifact", so the stage runs instead of being skipped.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::{ArtifactRef, WorkItemId};

use super::stage::StageDescriptor;

/// Answers "has this stage already produced its artifact?"
pub trait ArtifactResolver: Send + Sync {
    /// Existing valid artifact for a stage, if any
    fn detect(&self, work_item: &WorkItemId, stage: &StageDescriptor) -> Option<ArtifactRef>;

    /// Directory where a work item's artifacts live
    fn artifact_dir(&self, work_item: &WorkItemId) -> PathBuf;
}

/// Looks for artifacts on the local file system under
/// `<root>/<work_item>/`
#[derive(Debug, Clone)]
pub struct FsArtifactResolver {
    root: PathBuf,
}

impl FsArtifactResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn find(&self, work_item: &WorkItemId, stage: &StageDescriptor) -> io::Result<Option<ArtifactRef>> {
        let dir = self.artifact_dir(work_item);
        if !dir.is_dir() {
            return Ok(None);
        }

        let relative = expand_pattern(&stage.artifact_pattern, work_item, &stage.name);
        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            relative
        );

        let paths = glob::glob(&pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        for entry in paths {
            let path = entry.map_err(|e| e.into_error())?;
            let metadata = path.metadata()?;
            if !metadata.is_file() || metadata.len() == 0 {
                debug!(path = %path.display(), "Ignoring empty or non-file artifact candidate");
                continue;
            }

            let digest = file_digest(&path)?;
            let artifact = ArtifactRef::new(&stage.name, path.to_string_lossy())
                .with_content(digest, metadata.len());
            return Ok(Some(artifact));
        }

        Ok(None)
    }
}

impl ArtifactResolver for FsArtifactResolver {
    fn detect(&self, work_item: &WorkItemId, stage: &StageDescriptor) -> Option<ArtifactRef> {
        match self.find(work_item, stage) {
            Ok(found) => {
                if let Some(artifact) = &found {
                    debug!(%work_item, stage = %stage.name, location = %artifact.location, "Artifact found");
                }
                found
            }
            Err(e) => {
                warn!(
                    %work_item,
                    stage = %stage.name,
                    error = %e,
                    "Artifact detection failed, treating as absent"
                );
                None
            }
        }
    }

    fn artifact_dir(&self, work_item: &WorkItemId) -> PathBuf {
        self.root.join(work_item.as_str())
    }
}

/// Substitute `{stage}` and `{work_item}` placeholders
pub fn expand_pattern(pattern: &str, work_item: &WorkItemId, stage: &str) -> String {
    pattern
        .replace("{stage}", stage)
        .replace("{work_item}", work_item.as_str())
}

/// Hex SHA-256 of a file's content
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
