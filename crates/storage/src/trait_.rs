//! Storage trait abstraction.
//!
//! The orchestration core only needs atomic reads, compare-and-set, and
//! insert-if-absent over its three record types, plus a handful of indexed
//! lookups. Any durable store that offers those can back it.

use async_trait::async_trait;
use devflow_core::{
    DependencyEdge, EdgeKey, StageBinding, Task, TaskFilter, TaskId, WorkflowExecution,
    WorkflowId, WorkflowStage,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Storage abstraction for orchestration records.
///
/// Every method is atomic with respect to the record it touches. Writes that
/// race on the same record are arbitrated by `compare_and_set_*`: the caller
/// passes the revision it read, and the write only lands if nobody else wrote
/// in between.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Task operations ===

    /// Insert a task unless one with the same ID exists. Returns whether it was inserted.
    async fn insert_task(&self, task: &Task) -> Result<bool>;

    /// Load a task by ID.
    async fn load_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Replace a task if its stored revision equals `expected_version`.
    async fn compare_and_set_task(&self, expected_version: u64, task: &Task) -> Result<bool>;

    /// List tasks matching the filter, oldest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    // === Dependency edges ===

    /// Insert an edge unless the same (source, target, kind) triple exists.
    async fn insert_edge(&self, edge: &DependencyEdge) -> Result<bool>;

    /// Load an edge by its triple.
    async fn load_edge(&self, key: &EdgeKey) -> Result<Option<DependencyEdge>>;

    /// Overwrite an existing edge.
    async fn save_edge(&self, edge: &DependencyEdge) -> Result<()>;

    /// Delete an edge. Returns whether it existed.
    async fn delete_edge(&self, key: &EdgeKey) -> Result<bool>;

    /// Edges whose source is `source` (what it depends on).
    async fn edges_from(&self, source: TaskId) -> Result<Vec<DependencyEdge>>;

    /// Edges whose target is `target` (what depends on it).
    async fn edges_to(&self, target: TaskId) -> Result<Vec<DependencyEdge>>;

    // === Workflow operations ===

    /// Insert a workflow unless one with the same ID exists.
    async fn insert_workflow(&self, workflow: &WorkflowExecution) -> Result<bool>;

    /// Load a workflow by ID.
    async fn load_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowExecution>>;

    /// Replace a workflow if its stored revision equals `expected_version`.
    async fn compare_and_set_workflow(
        &self,
        expected_version: u64,
        workflow: &WorkflowExecution,
    ) -> Result<bool>;

    /// List all workflows, oldest first.
    async fn list_workflows(&self) -> Result<Vec<WorkflowExecution>>;

    // === Stage bindings ===

    /// Create or replace the binding at (workflow, stage, ordinal).
    async fn save_binding(&self, binding: &StageBinding) -> Result<()>;

    /// Bindings of a workflow, optionally for one stage, in stage then ordinal order.
    async fn list_bindings(
        &self,
        workflow_id: WorkflowId,
        stage: Option<WorkflowStage>,
    ) -> Result<Vec<StageBinding>>;

    /// Bindings that reference a task.
    async fn bindings_for_task(&self, task_id: TaskId) -> Result<Vec<StageBinding>>;
}
