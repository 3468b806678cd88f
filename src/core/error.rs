//! Orchestrator error taxonomy and exit codes.

use thiserror::Error;

use crate::domain::WorkItemId;

use super::lock::{LockError, LockRecord};
use super::pipeline::ConfigError;
use super::state_store::{StateCorruptionError, StateError};

/// Process exit codes for each kind of run conclusion
pub mod exit_code {
    pub const DONE: u8 = 0;
    pub const FAILED: u8 = 1;
    pub const BLOCKED: u8 = 2;
    pub const LOCKED: u8 = 3;
    pub const CONFIG: u8 = 4;
    pub const CORRUPT_STATE: u8 = 5;
    pub const INTERRUPTED: u8 = 6;
    pub const INTERNAL: u8 = 70;
}

/// Another orchestration holds the work item's lock
#[derive(Debug, Error)]
#[error("work item '{work_item}' is already being orchestrated{}", describe_holder(.holder.as_ref()))]
pub struct ConcurrencyError {
    pub work_item: WorkItemId,

    /// Current lock record, when readable
    pub holder: Option<LockRecord>,
}

fn describe_holder(holder: Option<&LockRecord>) -> String {
    match holder {
        Some(record) => format!(
            " (pid {} since {})",
            record.pid,
            record.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    State(StateError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("run for '{work_item}' interrupted; resume with: {resume_command}")]
    Interrupted {
        work_item: WorkItemId,
        resume_command: String,
    },
}

impl From<StateError> for OrchestratorError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<StateCorruptionError> for OrchestratorError {
    fn from(e: StateCorruptionError) -> Self {
        Self::State(StateError::Corrupt(e))
    }
}

impl OrchestratorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => exit_code::CONFIG,
            Self::Concurrency(_) => exit_code::LOCKED,
            Self::State(StateError::Corrupt(_)) => exit_code::CORRUPT_STATE,
            Self::State(_) | Self::Lock(_) => exit_code::INTERNAL,
            Self::Interrupted { .. } => exit_code::INTERRUPTED,
        }
    }

    /// Whether persisted state was found to be corrupt
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::State(StateError::Corrupt(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use uuid::Uuid;

    #[test]
    fn test_exit_codes() {
        let config: OrchestratorError = ConfigError::EmptyPipeline.into();
        assert_eq!(config.exit_code(), exit_code::CONFIG);

        let corrupt: OrchestratorError = StateCorruptionError {
            path: PathBuf::from("42.json"),
            reason: "bad".to_string(),
        }
        .into();
        assert_eq!(corrupt.exit_code(), exit_code::CORRUPT_STATE);
        assert!(corrupt.is_corruption());
    }

    #[test]
    fn test_concurrency_message_names_holder() {
        let err = ConcurrencyError {
            work_item: WorkItemId::new("42").unwrap(),
            holder: Some(LockRecord {
                work_item: WorkItemId::new("42").unwrap(),
                pid: 4242,
                token: Uuid::new_v4(),
                acquired_at: Utc::now(),
            }),
        };
        let message = err.to_string();
        assert!(message.contains("'42'"));
        assert!(message.contains("pid 4242"));

        let orchestrator: OrchestratorError = err.into();
        assert_eq!(orchestrator.exit_code(), exit_code::LOCKED);
    }
}
