//! Events emitted by the orchestration core.
//!
//! Delivery is fire-and-forget and at-least-once, so consumers must be
//! idempotent.

use crate::id::{ActorId, EventId, TaskId, WorkflowId};
use crate::task::TaskStatus;
use crate::workflow::WorkflowStage;
use crate::Time;
use serde::{Deserialize, Serialize};

/// An event is an atomic fact that happened at a specific time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier
    pub id: EventId,

    /// When it happened
    pub timestamp: Time,

    /// What happened
    pub kind: EventKind,
}

impl Event {
    /// Stamp a new event.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            timestamp: chrono::Utc::now(),
            kind,
        }
    }
}

/// The facts the core publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A task was created
    TaskCreated {
        /// Task
        task_id: TaskId,
    },

    /// Audit record of a status change
    TaskStatusChanged {
        /// Task
        task_id: TaskId,
        /// Previous status
        from: TaskStatus,
        /// New status
        to: TaskStatus,
        /// Who made the change
        actor: ActorId,
    },

    /// A task reached `completed`
    TaskCompleted {
        /// Task
        task_id: TaskId,
    },

    /// A task execution failed
    TaskFailed {
        /// Task
        task_id: TaskId,
        /// Error message
        error: String,
        /// Retry count after this failure
        retry_count: u32,
        /// The failure is terminal
        exhausted: bool,
    },

    /// An edge `source -> target` became satisfied
    DependencySatisfied {
        /// Dependent task to re-evaluate
        source_id: TaskId,
        /// Completed prerequisite
        target_id: TaskId,
    },

    /// A workflow moved to a new stage
    WorkflowStageAdvanced {
        /// Workflow
        workflow_id: WorkflowId,
        /// Stage left
        from: WorkflowStage,
        /// Stage entered
        to: WorkflowStage,
    },

    /// A workflow entered `error`
    WorkflowEnteredError {
        /// Workflow
        workflow_id: WorkflowId,
        /// Stage that failed
        stage: WorkflowStage,
        /// Why
        reason: String,
    },

    /// A workflow finished its final stage
    WorkflowCompleted {
        /// Workflow
        workflow_id: WorkflowId,
    },

    /// A workflow exhausted its stage retries
    WorkflowFailed {
        /// Workflow
        workflow_id: WorkflowId,
        /// Stage that kept failing
        stage: WorkflowStage,
    },

    /// A workflow was cancelled
    WorkflowCancelled {
        /// Workflow
        workflow_id: WorkflowId,
    },
}

impl EventKind {
    /// Short name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskCreated { .. } => "task_created",
            EventKind::TaskStatusChanged { .. } => "task_status_changed",
            EventKind::TaskCompleted { .. } => "task_completed",
            EventKind::TaskFailed { .. } => "task_failed",
            EventKind::DependencySatisfied { .. } => "dependency_satisfied",
            EventKind::WorkflowStageAdvanced { .. } => "workflow_stage_advanced",
            EventKind::WorkflowEnteredError { .. } => "workflow_entered_error",
            EventKind::WorkflowCompleted { .. } => "workflow_completed",
            EventKind::WorkflowFailed { .. } => "workflow_failed",
            EventKind::WorkflowCancelled { .. } => "workflow_cancelled",
        }
    }
}
