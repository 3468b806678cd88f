//! Stage contract and registry.
//!
//! A stage is an opaque collaborator: the orchestrator only looks at the
//! outcome it reports. Stages are registered by name and bound to the
//! resolved configuration once, producing ordered `StageDescriptor`s.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{ArtifactRef, OrchestrationState, WorkItemId};

use super::pipeline::{ConfigError, PipelineConfig, RetryPolicy};

/// What a stage reports when it returns normally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage produced its artifact
    Produced(ArtifactRef),

    /// The stage refuses to continue (never retried)
    Blocked { reason: String },
}

impl StageOutcome {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::Blocked {
            reason: reason.into(),
        }
    }
}

/// Read-only input handed to a stage invocation
#[derive(Debug, Clone)]
pub struct StageContext {
    pub work_item: WorkItemId,

    /// Name of the stage being run
    pub stage: String,

    /// 0-indexed position in the pipeline
    pub ordinal: usize,

    /// Current attempt (1-indexed)
    pub attempt: u32,

    pub max_attempts: u32,

    /// Directory where this work item's artifacts live
    pub artifact_dir: PathBuf,

    /// Snapshot of the orchestration state at invocation time
    pub state: Arc<OrchestrationState>,
}

impl StageContext {
    /// Artifact produced by an earlier stage
    pub fn artifact(&self, stage: &str) -> Option<&ArtifactRef> {
        self.state.artifacts.get(stage)
    }

    /// Artifacts of every stage before this one, in pipeline order
    pub fn prior_artifacts(&self) -> Vec<&ArtifactRef> {
        self.state
            .config
            .stages
            .iter()
            .take(self.ordinal)
            .filter_map(|s| self.state.artifacts.get(&s.name))
            .collect()
    }
}

/// An executable pipeline stage
#[async_trait]
pub trait Stage: Send + Sync {
    /// Run the stage. Errors are treated as retryable failures.
    async fn run(&self, ctx: StageContext) -> Result<StageOutcome>;
}

/// Static definition of one pipeline step
#[derive(Clone)]
pub struct StageDescriptor {
    pub name: String,
    pub ordinal: usize,
    pub stage: Arc<dyn Stage>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: RetryPolicy,
    pub gate: bool,
    pub skip_existing: bool,
    /// Artifact glob pattern used for skip detection
    pub artifact_pattern: String,
}

impl StageDescriptor {
    /// Total attempts allowed (first try plus retries)
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("ordinal", &self.ordinal)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("gate", &self.gate)
            .field("skip_existing", &self.skip_existing)
            .finish_non_exhaustive()
    }
}

/// Name → executable mapping
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executable for a stage name
    pub fn register(&mut self, name: impl Into<String>, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(name.into(), stage);
        self
    }

    /// Builder-style `register`
    pub fn with(mut self, name: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        self.register(name, stage);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Resolve every configured stage to its executable, in order
    pub fn bind(&self, config: &PipelineConfig) -> Result<Vec<StageDescriptor>, ConfigError> {
        config
            .stages
            .iter()
            .enumerate()
            .map(|(ordinal, settings)| {
                let stage = self.stages.get(&settings.name).cloned().ok_or_else(|| {
                    ConfigError::MissingField {
                        field: format!("stages.{}", settings.name),
                    }
                })?;

                Ok(StageDescriptor {
                    name: settings.name.clone(),
                    ordinal,
                    stage,
                    timeout: settings.timeout(),
                    max_retries: settings.max_retries,
                    backoff: config.backoff.clone(),
                    gate: settings.gate,
                    skip_existing: settings.skip_existing,
                    artifact_pattern: settings.artifact.clone(),
                })
            })
            .collect()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.stages.keys().collect();
        names.sort();
        f.debug_struct("StageRegistry").field("stages", &names).finish()
    }
}
