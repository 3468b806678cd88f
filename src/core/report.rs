//! Summary of one orchestration invocation.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::domain::{ArtifactRef, PlannedStage, StageResult, WorkItemId};

use super::error::exit_code;

/// How a run concluded
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    /// Every stage passed or was skipped
    Done { artifact: Option<ArtifactRef> },

    /// A stage refused to continue, or a gate waits for approval
    Blocked { stage: String, reason: String },

    /// A stage exhausted its retries
    Failed {
        stage: String,
        error: String,
        attempts: u32,
    },

    /// Dry run: what would happen
    Planned { stages: Vec<PlannedStage> },
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Done { .. } | Self::Planned { .. } => exit_code::DONE,
            Self::Failed { .. } => exit_code::FAILED,
            Self::Blocked { .. } => exit_code::BLOCKED,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Done { .. } => "done",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
            Self::Planned { .. } => "planned",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub work_item: WorkItemId,
    pub run_id: Uuid,
    pub outcome: RunOutcome,

    /// Full stage history of the work item (earlier invocations included)
    pub history: Vec<StageResult>,

    /// Wall time of this invocation
    pub elapsed_ms: u64,

    /// Command that continues the pipeline, for blocked and failed runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_command: Option<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.outcome, RunOutcome::Done { .. })
    }
}

/// Command line that resumes a work item, approving a gate if given
pub fn resume_command(work_item: &WorkItemId, approve: Option<&str>) -> String {
    match approve {
        Some(stage) => format!("conveyor run {} --resume --approve {}", work_item, stage),
        None => format!("conveyor run {} --resume", work_item),
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = format!("{:.1}s", self.elapsed_ms as f64 / 1000.0);
        match &self.outcome {
            RunOutcome::Done { artifact } => {
                write!(f, "[{}] done in {}", self.work_item, elapsed)?;
                if let Some(artifact) = artifact {
                    write!(f, "; artifact: {}", artifact.location)?;
                }
            }
            RunOutcome::Blocked { stage, reason } => {
                write!(f, "[{}] blocked at {} after {}: {}", self.work_item, stage, elapsed, reason)?;
            }
            RunOutcome::Failed {
                stage,
                error,
                attempts,
            } => {
                write!(
                    f,
                    "[{}] failed at {} after {} attempt(s) ({}): {}",
                    self.work_item, stage, attempts, elapsed, error
                )?;
            }
            RunOutcome::Planned { stages } => {
                write!(f, "[{}] dry run, nothing executed:", self.work_item)?;
                for planned in stages {
                    write!(f, "\n  {}", planned)?;
                }
                return Ok(());
            }
        }

        for result in &self.history {
            write!(
                f,
                "\n  {:<12} {:<8} {} attempt(s) {:.1}s",
                result.stage,
                result.status,
                result.attempts,
                result.duration_ms as f64 / 1000.0
            )?;
        }
        if let Some(command) = &self.resume_command {
            write!(f, "\n  resume: {}", command)?;
        }
        Ok(())
    }
}
