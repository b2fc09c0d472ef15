//! devflow core data models.
//!
//! This crate defines the task graph and workflow records that the
//! orchestration layers operate on. It performs no I/O.

#![warn(missing_docs)]

// Core identities
mod id;

// Task graph
mod task;
mod dependency;

// Workflow orchestration
mod workflow;
mod event;

// Re-exports
pub use id::*;

pub use task::{BlockReason, InvalidTransition, Priority, Task, TaskFilter, TaskSpec, TaskStatus};
pub use dependency::{DependencyEdge, DependencyKind, EdgeKey};
pub use workflow::{
    StageBinding, StageOutcome, StageRecord, WorkflowExecution, WorkflowStage, WorkflowStatus,
};
pub use event::{Event, EventKind};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;

/// A string did not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    /// What was being parsed
    pub kind: &'static str,
    /// The rejected input
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
