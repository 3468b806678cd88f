//! Domain types for the conveyor orchestrator.
//!
//! This module contains the core data structures:
//! - WorkItemId: Validated work item key
//! - ArtifactRef: Stage outputs
//! - StageResult: Append-only stage outcomes
//! - OrchestrationState: Persisted progress of one work item
//! - ProgressEvent: Notifications for reporters

pub mod artifact;
pub mod events;
pub mod result;
pub mod state;
pub mod work_item;

// Re-export commonly used types
pub use artifact::ArtifactRef;
pub use events::{PlanAction, PlannedStage, ProgressEvent};
pub use result::{StageResult, StageStatus};
pub use state::{InFlightStage, OrchestrationState, RunStatus, STATE_SCHEMA_VERSION};
pub use work_item::{InvalidWorkItemId, WorkItemId};
