//! Task store - CRUD and status transitions over the storage boundary.
//!
//! Every write is a compare-and-set against the revision that was read, so
//! concurrent callers never overwrite each other. Cross-component effects are
//! published as events rather than performed here.

use std::sync::Arc;

use chrono::Utc;
use devflow_core::{
    ActorId, EventKind, Task, TaskFilter, TaskId, TaskSpec, TaskStatus,
};
use devflow_storage::Storage;
use tracing::{debug, info};

use crate::error::{OrchestrationError, Result};
use crate::events::EventBus;

/// How many times a read-modify-write is retried after losing a race.
const MAX_WRITE_ATTEMPTS: usize = 8;

/// Default retry budget for tasks created without one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Holds tasks and enforces the status state machine.
pub struct TaskStore {
    storage: Arc<dyn Storage>,
    events: EventBus,
    default_max_retries: u32,
}

impl TaskStore {
    /// Create a store over `storage`, publishing to `events`.
    pub fn new(storage: Arc<dyn Storage>, events: EventBus) -> Self {
        Self {
            storage,
            events,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set the retry budget applied when a [`TaskSpec`] leaves it unset.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// The backing storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Create a task and return its ID.
    pub async fn create(&self, spec: TaskSpec) -> Result<TaskId> {
        Ok(self.create_task(spec).await?.id)
    }

    /// Create a task and return it.
    ///
    /// Hierarchy fields are derived from the parent, which must exist, be
    /// live, and belong to the same organization.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        if spec.name.trim().is_empty() {
            return Err(OrchestrationError::Validation("task name must not be empty".into()));
        }
        if !matches!(spec.initial_status, TaskStatus::Draft | TaskStatus::Pending) {
            return Err(OrchestrationError::Validation(format!(
                "tasks are created in draft or pending, not {}",
                spec.initial_status
            )));
        }

        let parent = match spec.parent_id {
            Some(parent_id) => {
                let parent = self
                    .storage
                    .load_task(parent_id)
                    .await?
                    .filter(|p| !p.is_deleted())
                    .ok_or_else(|| {
                        OrchestrationError::Validation(format!("parent task {} does not exist", parent_id))
                    })?;
                if parent.organization_id != spec.organization_id {
                    return Err(OrchestrationError::Validation(format!(
                        "parent task {} belongs to another organization",
                        parent_id
                    )));
                }
                Some(parent)
            }
            None => None,
        };

        let task = Task::from_spec(spec, parent.as_ref(), self.default_max_retries, Utc::now());
        if !self.storage.insert_task(&task).await? {
            return Err(OrchestrationError::Conflict(format!("task {}", task.id)));
        }

        info!("Created task {} '{}' (level {}, status {})", task.id, task.name, task.level, task.status);
        self.events.publish(EventKind::TaskCreated { task_id: task.id });
        Ok(task)
    }

    /// Load a task, failing if it does not exist.
    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.storage
            .load_task(id)
            .await?
            .ok_or(OrchestrationError::TaskNotFound(id))
    }

    /// Apply a status change from whatever the current status is.
    pub async fn update_status(&self, id: TaskId, new_status: TaskStatus, actor: &ActorId) -> Result<Task> {
        self.transition_with(id, new_status, actor, |_| {}).await
    }

    /// Apply a status change and further edits in the same write.
    ///
    /// Lost races are retried against the fresh revision; the transition is
    /// re-validated each time.
    pub async fn transition_with<F>(
        &self,
        id: TaskId,
        next: TaskStatus,
        actor: &ActorId,
        mut mutate: F,
    ) -> Result<Task>
    where
        F: FnMut(&mut Task) + Send,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.get(id).await?;
            let mut task = current.clone();
            task.transition(next, actor, Utc::now())
                .map_err(|e| OrchestrationError::InvalidTransition { task_id: id, from: e.from, to: e.to })?;
            mutate(&mut task);

            if self.storage.compare_and_set_task(current.version, &task).await? {
                self.after_transition(&current, &task, actor);
                return Ok(task);
            }
            debug!("Lost write race on task {}, retrying", id);
        }
        Err(OrchestrationError::Conflict(format!("task {}", id)))
    }

    /// Move from exactly `expected` to `next`.
    ///
    /// Returns `None` when the task is no longer in `expected` or another
    /// writer got there first. This is the claim primitive: the loser simply
    /// gets nothing back.
    pub async fn transition_if<F>(
        &self,
        id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        actor: &ActorId,
        mutate: F,
    ) -> Result<Option<Task>>
    where
        F: FnOnce(&mut Task) + Send,
    {
        let current = self.get(id).await?;
        if current.status != expected {
            return Ok(None);
        }

        let mut task = current.clone();
        task.transition(next, actor, Utc::now())
            .map_err(|e| OrchestrationError::InvalidTransition { task_id: id, from: e.from, to: e.to })?;
        mutate(&mut task);

        if self.storage.compare_and_set_task(current.version, &task).await? {
            self.after_transition(&current, &task, actor);
            Ok(Some(task))
        } else {
            debug!("Task {} changed under us ({} -> {} lost)", id, expected, next);
            Ok(None)
        }
    }

    /// Edit non-status fields.
    pub async fn modify<F>(&self, id: TaskId, mut mutate: F) -> Result<Task>
    where
        F: FnMut(&mut Task) -> Result<()> + Send,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.get(id).await?;
            let mut task = current.clone();
            mutate(&mut task)?;
            task.status = current.status;
            task.touch(Utc::now());

            if self.storage.compare_and_set_task(current.version, &task).await? {
                return Ok(task);
            }
        }
        Err(OrchestrationError::Conflict(format!("task {}", id)))
    }

    /// Tombstone a task. Only drafts and terminal tasks can be deleted.
    ///
    /// Callers that own dependency edges must remove them first; the store
    /// does not reach into the graph.
    pub async fn soft_delete(&self, id: TaskId) -> Result<Task> {
        let task = self
            .modify(id, |task| {
                if task.is_deleted() {
                    return Ok(());
                }
                if !(task.status == TaskStatus::Draft || task.status.is_terminal()) {
                    return Err(OrchestrationError::Validation(format!(
                        "task {} is {} and cannot be deleted",
                        task.id, task.status
                    )));
                }
                task.deleted_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        info!("Deleted task {}", id);
        Ok(task)
    }

    /// Direct children of a task.
    pub async fn list_children(&self, parent_id: TaskId) -> Result<Vec<Task>> {
        let filter = TaskFilter {
            parent_id: Some(parent_id),
            ..Default::default()
        };
        Ok(self.storage.list_tasks(&filter).await?)
    }

    /// Tasks in `status` that also match `filter`.
    pub async fn list_by_status(&self, status: TaskStatus, filter: &TaskFilter) -> Result<Vec<Task>> {
        let filter = TaskFilter {
            status: Some(vec![status]),
            ..filter.clone()
        };
        Ok(self.storage.list_tasks(&filter).await?)
    }

    /// Tasks matching `filter`.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.storage.list_tasks(filter).await?)
    }

    fn after_transition(&self, before: &Task, after: &Task, actor: &ActorId) {
        info!("Task {} {} -> {} by {}", after.id, before.status, after.status, actor);
        self.events.publish(EventKind::TaskStatusChanged {
            task_id: after.id,
            from: before.status,
            to: after.status,
            actor: actor.clone(),
        });
        if after.status == TaskStatus::Completed {
            self.events.publish(EventKind::TaskCompleted { task_id: after.id });
        }
    }
}
