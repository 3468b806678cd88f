//! conveyor - Resumable stage pipeline orchestrator
//!
//! Drives a work item through an ordered list of stages, one at a time,
//! with per-stage timeouts and retries, artifact-based skipping, human
//! approval gates and crash-safe resume.
//!
//! # Architecture
//!
//! - Every transition is persisted to a per-work-item state file before
//!   it is reported
//! - A per-work-item lock file keeps two orchestrations apart
//! - Interrupted runs resume at the stage (and attempt) they reached
//!
//! # Modules
//!
//! - `adapters`: Command stages backed by external programs
//! - `core`: Orchestration logic (config, locks, state, executor)
//! - `domain`: Data structures (state, results, artifacts, events)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a work item through the pipeline
//! conveyor run 42
//!
//! # Approve a gate and continue
//! conveyor run 42 --resume --approve design
//!
//! # Inspect persisted state
//! conveyor status 42
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{
    Orchestrator, OrchestratorError, PipelineConfig, RunOutcome, RunReport, RunRequest, Stage,
    StageContext, StageOutcome, StageRegistry,
};
pub use domain::{ArtifactRef, OrchestrationState, RunStatus, StageResult, StageStatus, WorkItemId};
