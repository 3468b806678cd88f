//! Artifacts produced by pipeline stages.
//!
//! An artifact is the durable output of a stage. It is both the stage's
//! deliverable and the signal used to skip the stage on a later run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to an artifact produced (or discovered) for a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Name of the stage that produced this artifact
    pub stage: String,

    /// File path or external URI of the artifact
    pub location: String,

    /// Hex SHA-256 of the artifact content (file artifacts only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Size in bytes (for tracking)
    #[serde(default)]
    pub size_bytes: u64,

    /// When the artifact was recorded
    pub recorded_at: DateTime<Utc>,
}

impl ArtifactRef {
    /// Create a new artifact reference
    pub fn new(stage: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            location: location.into(),
            digest: None,
            size_bytes: 0,
            recorded_at: Utc::now(),
        }
    }

    /// Attach content metadata
    pub fn with_content(mut self, digest: String, size_bytes: u64) -> Self {
        self.digest = Some(digest);
        self.size_bytes = size_bytes;
        self
    }

    /// An artifact is usable when it points somewhere
    pub fn is_valid(&self) -> bool {
        !self.location.trim().is_empty()
    }
}
