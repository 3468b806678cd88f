//! Stage outcomes.
//!
//! One `StageResult` is recorded per stage conclusion and appended to the
//! orchestration history; results are never edited afterwards.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifact::ArtifactRef;

/// How a stage concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage ran and produced an artifact
    Passed,

    /// Stage stopped on a non-retryable condition
    Blocked,

    /// Stage failed after exhausting its retries
    Failed,

    /// Stage was not run because a valid artifact already existed
    Skipped,
}

impl StageStatus {
    /// Passed or skipped: the pipeline may continue
    pub fn is_success(self) -> bool {
        matches!(self, Self::Passed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of one stage, as stored in the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name
    pub stage: String,

    pub status: StageStatus,

    /// Produced or discovered artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,

    /// Error message or block reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wall time across all attempts in milliseconds
    #[serde(default)]
    pub duration_ms: u64,

    /// Number of attempts made (0 for skipped stages)
    #[serde(default)]
    pub attempts: u32,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    /// Create a result finished now
    pub fn new(stage: impl Into<String>, status: StageStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            stage: stage.into(),
            status,
            artifact: None,
            error: None,
            duration_ms: 0,
            attempts: 0,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Result for a stage skipped because its artifact already exists
    pub fn skipped(artifact: ArtifactRef) -> Self {
        let now = Utc::now();
        Self::new(artifact.stage.clone(), StageStatus::Skipped, now).with_artifact(artifact)
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}
