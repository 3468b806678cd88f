//! Progress events emitted by the orchestrator.
//!
//! Events are emitted after the matching state change has been persisted,
//! so a reporter never announces progress that a crash could lose.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRef;
use super::result::StageResult;
use super::work_item::WorkItemId;

/// What a run would do with a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum PlanAction {
    /// Stage function would be invoked
    Execute,

    /// A valid artifact exists, the stage would be skipped
    Skip { artifact: ArtifactRef },

    /// Already concluded in persisted state (resume)
    Complete,

    /// Waits for a gate approval
    Gated,
}

/// One line of a dry-run plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStage {
    pub stage: String,
    #[serde(flatten)]
    pub action: PlanAction,
}

impl fmt::Display for PlannedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            PlanAction::Execute => write!(f, "{:<12} would execute", self.stage),
            PlanAction::Skip { artifact } => {
                write!(f, "{:<12} would skip (artifact {})", self.stage, artifact.location)
            }
            PlanAction::Complete => write!(f, "{:<12} already complete", self.stage),
            PlanAction::Gated => write!(f, "{:<12} waits for approval", self.stage),
        }
    }
}

/// A single progress notification
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ProgressEvent {
    RunStarted {
        work_item: WorkItemId,
        run_id: Uuid,
        resumed: bool,
        start_stage: Option<String>,
        total_stages: usize,
    },

    PlanReady {
        work_item: WorkItemId,
        plan: Vec<PlannedStage>,
    },

    StageSkipped {
        work_item: WorkItemId,
        stage: String,
        artifact: ArtifactRef,
        elapsed_ms: u64,
    },

    StageStarted {
        work_item: WorkItemId,
        stage: String,
        /// 1-indexed position in the pipeline
        position: usize,
        total_stages: usize,
        elapsed_ms: u64,
        /// Stages that have produced artifacts so far
        artifacts: Vec<String>,
    },

    AttemptFailed {
        work_item: WorkItemId,
        stage: String,
        attempt: u32,
        max_attempts: u32,
        error: String,
        retry_in_ms: u64,
    },

    StageFinished {
        work_item: WorkItemId,
        result: StageResult,
        elapsed_ms: u64,
    },

    GateBlocked {
        work_item: WorkItemId,
        stage: String,
        reason: String,
    },

    RunFinished {
        work_item: WorkItemId,
        status: String,
        stage: Option<String>,
        elapsed_ms: u64,
    },
}

impl ProgressEvent {
    pub fn work_item(&self) -> &WorkItemId {
        match self {
            Self::RunStarted { work_item, .. }
            | Self::PlanReady { work_item, .. }
            | Self::StageSkipped { work_item, .. }
            | Self::StageStarted { work_item, .. }
            | Self::AttemptFailed { work_item, .. }
            | Self::StageFinished { work_item, .. }
            | Self::GateBlocked { work_item, .. }
            | Self::RunFinished { work_item, .. } => work_item,
        }
    }

    /// Short event name (matches the serialized tag)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::PlanReady { .. } => "plan_ready",
            Self::StageSkipped { .. } => "stage_skipped",
            Self::StageStarted { .. } => "stage_started",
            Self::AttemptFailed { .. } => "attempt_failed",
            Self::StageFinished { .. } => "stage_finished",
            Self::GateBlocked { .. } => "gate_blocked",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}

fn secs(ms: u64) -> String {
    format!("{:.1}s", ms as f64 / 1000.0)
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunStarted {
                work_item,
                resumed,
                start_stage,
                total_stages,
                ..
            } => {
                let verb = if *resumed { "Resuming" } else { "Starting" };
                match start_stage {
                    Some(stage) => write!(
                        f,
                        "[{}] {} pipeline at '{}' ({} stages)",
                        work_item, verb, stage, total_stages
                    ),
                    None => write!(f, "[{}] {} pipeline ({} stages)", work_item, verb, total_stages),
                }
            }
            Self::PlanReady { work_item, plan } => {
                write!(f, "[{}] Plan:", work_item)?;
                for planned in plan {
                    write!(f, "\n  {}", planned)?;
                }
                Ok(())
            }
            Self::StageSkipped {
                work_item,
                stage,
                artifact,
                elapsed_ms,
            } => write!(
                f,
                "[{}] {} skipped, artifact exists: {} (+{})",
                work_item,
                stage,
                artifact.location,
                secs(*elapsed_ms)
            ),
            Self::StageStarted {
                work_item,
                stage,
                position,
                total_stages,
                elapsed_ms,
                artifacts,
            } => {
                write!(
                    f,
                    "[{}] ({}/{}) {} started (+{})",
                    work_item,
                    position,
                    total_stages,
                    stage,
                    secs(*elapsed_ms)
                )?;
                if !artifacts.is_empty() {
                    write!(f, ", artifacts so far: {}", artifacts.join(", "))?;
                }
                Ok(())
            }
            Self::AttemptFailed {
                work_item,
                stage,
                attempt,
                max_attempts,
                error,
                retry_in_ms,
            } => write!(
                f,
                "[{}] {} attempt {}/{} failed: {}; retrying in {}",
                work_item,
                stage,
                attempt,
                max_attempts,
                error,
                secs(*retry_in_ms)
            ),
            Self::StageFinished {
                work_item,
                result,
                elapsed_ms,
            } => {
                write!(
                    f,
                    "[{}] {} {} in {} after {} attempt(s) (+{})",
                    work_item,
                    result.stage,
                    result.status,
                    secs(result.duration_ms),
                    result.attempts,
                    secs(*elapsed_ms)
                )?;
                if let Some(error) = &result.error {
                    write!(f, ": {}", error)?;
                }
                Ok(())
            }
            Self::GateBlocked {
                work_item,
                stage,
                reason,
            } => write!(f, "[{}] {} gated: {}", work_item, stage, reason),
            Self::RunFinished {
                work_item,
                status,
                stage,
                elapsed_ms,
            } => match stage {
                Some(stage) => write!(
                    f,
                    "[{}] Pipeline {} at '{}' after {}",
                    work_item,
                    status,
                    stage,
                    secs(*elapsed_ms)
                ),
                None => write!(f, "[{}] Pipeline {} after {}", work_item, status, secs(*elapsed_ms)),
            },
        }
    }
}
