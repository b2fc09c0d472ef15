//! In-memory storage backend.
//!
//! Keeps secondary indexes for the lookups the scheduler and graph manager
//! hit on every call: tasks by status, edges by source and by target, and
//! bindings by task.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use devflow_core::{
    DependencyEdge, EdgeKey, StageBinding, Task, TaskFilter, TaskId, TaskStatus,
    WorkflowExecution, WorkflowId, WorkflowStage,
};
use tokio::sync::RwLock;

use super::{Result, Storage};

type BindingKey = (WorkflowId, WorkflowStage, u32);

fn binding_key(binding: &StageBinding) -> BindingKey {
    (binding.workflow_id, binding.stage, binding.ordinal)
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    tasks_by_status: HashMap<TaskStatus, BTreeSet<TaskId>>,
    edges: HashMap<EdgeKey, DependencyEdge>,
    edges_by_source: HashMap<TaskId, BTreeSet<EdgeKey>>,
    edges_by_target: HashMap<TaskId, BTreeSet<EdgeKey>>,
    workflows: HashMap<WorkflowId, WorkflowExecution>,
    bindings: BTreeMap<BindingKey, StageBinding>,
    bindings_by_task: HashMap<TaskId, BTreeSet<BindingKey>>,
}

impl Inner {
    fn index_task(&mut self, task: &Task) {
        self.tasks_by_status.entry(task.status).or_default().insert(task.id);
    }

    fn unindex_task(&mut self, task: &Task) {
        if let Some(ids) = self.tasks_by_status.get_mut(&task.status) {
            ids.remove(&task.id);
        }
    }

    fn put_task(&mut self, task: &Task) {
        if let Some(old) = self.tasks.remove(&task.id) {
            self.unindex_task(&old);
        }
        self.index_task(task);
        self.tasks.insert(task.id, task.clone());
    }
}

/// Volatile storage for tests and embedded use.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_task(&self, task: &Task) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Ok(false);
        }
        inner.put_task(task);
        Ok(true)
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(&id).cloned())
    }

    async fn compare_and_set_task(&self, expected_version: u64, task: &Task) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let current = inner.tasks.get(&task.id).map(|t| t.version);
        if current != Some(expected_version) {
            return Ok(false);
        }
        inner.put_task(task);
        Ok(true)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = match &filter.status {
            Some(statuses) => statuses
                .iter()
                .filter_map(|s| inner.tasks_by_status.get(s))
                .flatten()
                .filter_map(|id| inner.tasks.get(id))
                .filter(|t| filter.matches(t))
                .cloned()
                .collect(),
            None => inner.tasks.values().filter(|t| filter.matches(t)).cloned().collect(),
        };
        sort_tasks(&mut tasks);
        Ok(tasks)
    }

    async fn insert_edge(&self, edge: &DependencyEdge) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let key = edge.key();
        if inner.edges.contains_key(&key) {
            return Ok(false);
        }
        inner.edges_by_source.entry(key.source_id).or_default().insert(key);
        inner.edges_by_target.entry(key.target_id).or_default().insert(key);
        inner.edges.insert(key, edge.clone());
        Ok(true)
    }

    async fn load_edge(&self, key: &EdgeKey) -> Result<Option<DependencyEdge>> {
        Ok(self.inner.read().await.edges.get(key).cloned())
    }

    async fn save_edge(&self, edge: &DependencyEdge) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = edge.key();
        if !inner.edges.contains_key(&key) {
            return Err(super::StorageError::NotFound(format!("edge {}", key)));
        }
        inner.edges.insert(key, edge.clone());
        Ok(())
    }

    async fn delete_edge(&self, key: &EdgeKey) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.edges.remove(key).is_none() {
            return Ok(false);
        }
        if let Some(keys) = inner.edges_by_source.get_mut(&key.source_id) {
            keys.remove(key);
        }
        if let Some(keys) = inner.edges_by_target.get_mut(&key.target_id) {
            keys.remove(key);
        }
        Ok(true)
    }

    async fn edges_from(&self, source: TaskId) -> Result<Vec<DependencyEdge>> {
        let inner = self.inner.read().await;
        Ok(inner
            .edges_by_source
            .get(&source)
            .into_iter()
            .flatten()
            .filter_map(|k| inner.edges.get(k).cloned())
            .collect())
    }

    async fn edges_to(&self, target: TaskId) -> Result<Vec<DependencyEdge>> {
        let inner = self.inner.read().await;
        Ok(inner
            .edges_by_target
            .get(&target)
            .into_iter()
            .flatten()
            .filter_map(|k| inner.edges.get(k).cloned())
            .collect())
    }

    async fn insert_workflow(&self, workflow: &WorkflowExecution) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.workflows.contains_key(&workflow.id) {
            return Ok(false);
        }
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(true)
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowExecution>> {
        Ok(self.inner.read().await.workflows.get(&id).cloned())
    }

    async fn compare_and_set_workflow(
        &self,
        expected_version: u64,
        workflow: &WorkflowExecution,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let current = inner.workflows.get(&workflow.id).map(|w| w.version);
        if current != Some(expected_version) {
            return Ok(false);
        }
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(true)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowExecution>> {
        let mut workflows: Vec<_> = self.inner.read().await.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(workflows)
    }

    async fn save_binding(&self, binding: &StageBinding) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = binding_key(binding);
        if let Some(old) = inner.bindings.insert(key, binding.clone()) {
            if let Some(keys) = inner.bindings_by_task.get_mut(&old.task_id) {
                keys.remove(&key);
            }
        }
        inner.bindings_by_task.entry(binding.task_id).or_default().insert(key);
        Ok(())
    }

    async fn list_bindings(
        &self,
        workflow_id: WorkflowId,
        stage: Option<WorkflowStage>,
    ) -> Result<Vec<StageBinding>> {
        let inner = self.inner.read().await;
        Ok(inner
            .bindings
            .range((workflow_id, WorkflowStage::ProjectSelection, 0)..=(workflow_id, WorkflowStage::Error, u32::MAX))
            .map(|(_, b)| b)
            .filter(|b| stage.map_or(true, |s| b.stage == s))
            .cloned()
            .collect())
    }

    async fn bindings_for_task(&self, task_id: TaskId) -> Result<Vec<StageBinding>> {
        let inner = self.inner.read().await;
        Ok(inner
            .bindings_by_task
            .get(&task_id)
            .into_iter()
            .flatten()
            .filter_map(|k| inner.bindings.get(k).cloned())
            .collect())
    }
}
