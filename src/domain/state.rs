//! Orchestration state for a single work item.
//!
//! `OrchestrationState` is the one mutable record of progress. The
//! orchestrator mutates it after every transition and hands it to the
//! state store; stages only ever see a read-only snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRef;
use super::result::{StageResult, StageStatus};
use super::work_item::WorkItemId;
use crate::core::pipeline::PipelineConfig;

/// Current schema version of persisted state.
///
/// Fields added after version 1 must carry `#[serde(default)]`.
pub const STATE_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

/// Full progress record for one work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    pub work_item: WorkItemId,

    /// Identifier of the orchestration run that created this state
    pub run_id: Uuid,

    #[serde(default)]
    pub status: RunStatus,

    /// Last stage that was started (not necessarily completed)
    #[serde(default)]
    pub current_stage: Option<String>,

    /// Stage currently executing and the attempts it has consumed
    #[serde(default)]
    pub in_flight: Option<InFlightStage>,

    /// Append-only stage result history
    #[serde(default)]
    pub history: Vec<StageResult>,

    /// Latest artifact per stage
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRef>,

    /// Stages whose gate has been approved
    #[serde(default)]
    pub approvals: BTreeSet<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub stage_started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Configuration snapshot in effect
    pub config: PipelineConfig,
}

/// A stage that has been started but has not concluded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightStage {
    pub stage: String,

    /// Attempts started so far
    #[serde(default)]
    pub attempts: u32,
}

/// Lifecycle of an orchestration run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Created, no stage started yet
    #[default]
    Init,

    /// Stages are being executed
    Running,

    /// Every stage passed or was skipped
    Done,

    /// Halted by a stage or an unapproved gate
    Blocked { stage: String, reason: String },

    /// A stage exhausted its retries
    Failed { stage: String, error: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Blocked { .. } | Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Done => "done",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { stage, reason } => write!(f, "blocked at {}: {}", stage, reason),
            Self::Failed { stage, error } => write!(f, "failed at {}: {}", stage, error),
            other => f.write_str(other.label()),
        }
    }
}

impl OrchestrationState {
    /// Fresh state for a new orchestration run
    pub fn new(work_item: WorkItemId, config: PipelineConfig) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            work_item,
            run_id: Uuid::new_v4(),
            status: RunStatus::Init,
            current_stage: None,
            in_flight: None,
            history: Vec::new(),
            artifacts: BTreeMap::new(),
            approvals: BTreeSet::new(),
            started_at: Utc::now(),
            stage_started_at: None,
            completed_at: None,
            config,
        }
    }

    /// Mark a stage as started. An interrupted attempt count for the same
    /// stage is kept so its retry budget carries over.
    pub fn begin_stage(&mut self, stage: &str) {
        self.status = RunStatus::Running;
        self.completed_at = None;
        self.current_stage = Some(stage.to_string());
        self.stage_started_at = Some(Utc::now());

        let carried = self
            .in_flight
            .as_ref()
            .filter(|f| f.stage == stage)
            .map_or(0, |f| f.attempts);
        self.in_flight = Some(InFlightStage {
            stage: stage.to_string(),
            attempts: carried,
        });
    }

    /// Record that an attempt (1-indexed) is starting
    pub fn begin_attempt(&mut self, stage: &str, attempt: u32) {
        self.in_flight = Some(InFlightStage {
            stage: stage.to_string(),
            attempts: attempt,
        });
    }

    /// Attempts already consumed by an unfinished stage
    pub fn attempts_in_flight(&self, stage: &str) -> u32 {
        self.in_flight
            .as_ref()
            .filter(|f| f.stage == stage)
            .map_or(0, |f| f.attempts)
    }

    /// Append a stage result to the history
    pub fn record(&mut self, result: StageResult) {
        if result.status.is_success() {
            if let Some(artifact) = &result.artifact {
                self.artifacts.insert(result.stage.clone(), artifact.clone());
            }
        }
        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.stage == result.stage)
        {
            self.in_flight = None;
        }
        self.history.push(result);
    }

    /// Set a terminal status
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Most recent result recorded for a stage
    pub fn last_result(&self, stage: &str) -> Option<&StageResult> {
        self.history.iter().rev().find(|r| r.stage == stage)
    }

    /// Index of the stage a resume should start at
    pub fn resume_index(&self) -> usize {
        let Some(stage) = &self.current_stage else {
            return 0;
        };
        let Some(idx) = self.config.stage_index(stage) else {
            return 0;
        };

        if self.in_flight.is_some() {
            return idx;
        }

        match self.last_result(stage) {
            Some(result) if result.status.is_success() => idx + 1,
            _ => idx,
        }
    }

    /// Artifact of the last stage in the pipeline, if any
    pub fn terminal_artifact(&self) -> Option<&ArtifactRef> {
        self.config
            .stages
            .last()
            .and_then(|s| self.artifacts.get(&s.name))
    }

    /// Count of results with a given status
    pub fn count(&self, status: StageStatus) -> usize {
        self.history.iter().filter(|r| r.status == status).count()
    }

    /// Structural validation of a loaded record
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version > STATE_SCHEMA_VERSION {
            return Err(format!(
                "schema version {} is newer than supported version {}",
                self.schema_version, STATE_SCHEMA_VERSION
            ));
        }
        if self.config.stages.is_empty() {
            return Err("configuration snapshot has no stages".to_string());
        }

        let known = |stage: &str| self.config.stage_index(stage).is_some();

        if let Some(stage) = &self.current_stage {
            if !known(stage) {
                return Err(format!("current stage '{}' is not in the pipeline", stage));
            }
        }
        if let Some(in_flight) = &self.in_flight {
            if !known(&in_flight.stage) {
                return Err(format!(
                    "in-flight stage '{}' is not in the pipeline",
                    in_flight.stage
                ));
            }
        }
        for (idx, result) in self.history.iter().enumerate() {
            if !known(&result.stage) {
                return Err(format!(
                    "history entry {} refers to unknown stage '{}'",
                    idx, result.stage
                ));
            }
            match result.status {
                StageStatus::Skipped if result.artifact.is_none() => {
                    return Err(format!(
                        "history entry {} ({}) is skipped without an artifact",
                        idx, result.stage
                    ));
                }
                StageStatus::Skipped => {}
                _ if result.attempts == 0 => {
                    return Err(format!(
                        "history entry {} ({}) records zero attempts",
                        idx, result.stage
                    ));
                }
                _ => {}
            }
        }
        for stage in self.artifacts.keys() {
            if !known(stage) {
                return Err(format!("artifact recorded for unknown stage '{}'", stage));
            }
        }
        if self.status.is_terminal() && self.completed_at.is_none() {
            return Err(format!(
                "status '{}' is terminal but no completion time is recorded",
                self.status.label()
            ));
        }

        Ok(())
    }
}
