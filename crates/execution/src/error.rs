//! Error taxonomy shared by the task store, graph manager, and scheduler.

use devflow_core::{TaskId, TaskStatus};
use devflow_storage::StorageError;

/// Result alias for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Errors surfaced by the orchestration core.
///
/// Validation and transition errors are caller errors and are never retried
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// Malformed input, rejected before any state change
    #[error("validation failed: {0}")]
    Validation(String),

    /// No such task
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The transition table does not allow this change
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task
        task_id: TaskId,
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },

    /// Adding the edge would close a cycle among hard dependencies
    #[error("dependency {source_id} -> {target_id} would create a cycle")]
    CyclicDependency {
        /// Dependent task
        source_id: TaskId,
        /// Prerequisite task
        target_id: TaskId,
    },

    /// Kept losing compare-and-set races on a record
    #[error("concurrent modification of {0}")]
    Conflict(String),

    /// Backing store failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl OrchestrationError {
    /// Caller errors that must not be retried automatically.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            OrchestrationError::Validation(_)
                | OrchestrationError::InvalidTransition { .. }
                | OrchestrationError::CyclicDependency { .. }
        )
    }
}
