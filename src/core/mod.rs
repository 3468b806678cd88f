//! Core orchestration logic.
//!
//! This module contains:
//! - Pipeline: Configuration resolution
//! - LockManager: Per-work-item exclusivity
//! - ArtifactResolver: Skip detection
//! - StateStore: Durable orchestration state
//! - StageExecutor: Deadline, retry and classification
//! - Orchestrator: Main execution engine
//! - ProgressReporter: Progress notifications

pub mod artifacts;
pub mod error;
pub mod executor;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod reporter;
pub mod stage;
pub mod state_store;

// Re-export commonly used types
pub use artifacts::{ArtifactResolver, FsArtifactResolver};
pub use error::{exit_code, ConcurrencyError, OrchestratorError};
pub use executor::StageExecutor;
pub use lock::{LockError, LockManager, LockRecord};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunRequest};
pub use pipeline::{ConfigError, ConfigOverrides, PipelineConfig, RetryPolicy, StageSettings};
pub use report::{resume_command, RunOutcome, RunReport};
pub use reporter::{
    ConsoleReporter, FanoutReporter, NullReporter, ProgressReporter, TracingReporter,
};
pub use stage::{Stage, StageContext, StageDescriptor, StageOutcome, StageRegistry};
pub use state_store::{StateCorruptionError, StateError, StateStore};
