//! Workflow engine errors.

use devflow_core::{WorkflowId, WorkflowStage, WorkflowStatus};
use devflow_execution::OrchestrationError;
use devflow_storage::StorageError;

use crate::adapter::AdapterError;

/// Result alias for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors from the stage engine and orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// No such workflow
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),

    /// The stage ordering forbids this move
    #[error("workflow {workflow_id} cannot move from {from} to {to}")]
    InvalidStageTransition {
        /// Workflow
        workflow_id: WorkflowId,
        /// Current stage
        from: WorkflowStage,
        /// Requested stage
        to: WorkflowStage,
    },

    /// The workflow's status does not allow the operation
    #[error("workflow {workflow_id} is {status}; cannot {operation}")]
    InvalidState {
        /// Workflow
        workflow_id: WorkflowId,
        /// Current status
        status: WorkflowStatus,
        /// Attempted operation
        operation: &'static str,
    },

    /// Stage retries are used up; the workflow is now failed
    #[error("workflow {workflow_id} exhausted {retries} retries of stage {stage}")]
    RetryExhausted {
        /// Workflow
        workflow_id: WorkflowId,
        /// Stage that kept failing
        stage: WorkflowStage,
        /// Retries attempted
        retries: u32,
    },

    /// Integration adapter failure
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Bad configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Task store, graph, or scheduler failure
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    /// Backing store failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl WorkflowError {
    /// The request was wrong for the current state rather than the system
    /// failing; retrying it unchanged will not help.
    pub fn is_caller_error(&self) -> bool {
        match self {
            WorkflowError::InvalidStageTransition { .. } | WorkflowError::InvalidState { .. } => true,
            WorkflowError::Orchestration(e) => e.is_caller_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::TaskId;

    #[test]
    fn test_caller_errors() {
        let id = WorkflowId::new();
        assert!(WorkflowError::InvalidState {
            workflow_id: id,
            status: WorkflowStatus::Completed,
            operation: "advance",
        }
        .is_caller_error());
        assert!(WorkflowError::from(OrchestrationError::CyclicDependency {
            source_id: TaskId::new(),
            target_id: TaskId::new(),
        })
        .is_caller_error());

        assert!(!WorkflowError::from(OrchestrationError::Conflict("workflow".into())).is_caller_error());
        assert!(!WorkflowError::from(StorageError::Other("disk".into())).is_caller_error());
        assert!(!WorkflowError::NotFound(id).is_caller_error());
    }
}
