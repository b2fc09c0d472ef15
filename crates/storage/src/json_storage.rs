//! JSON file storage implementation.
//!
//! Stores one JSON file per record under a root directory and keeps small
//! per-object meta markers (version + updated_at). The meta marker is the
//! authority for compare-and-set: a write only lands when the marker still
//! carries the revision the caller read.

use std::path::{Path, PathBuf};

use devflow_core::{
    DependencyEdge, EdgeKey, StageBinding, Task, TaskFilter, TaskId, WorkflowExecution,
    WorkflowId, WorkflowStage,
};
use super::{Storage, StorageError, Result};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// File-based JSON storage backend.
///
/// Writes go through a single process-wide mutex so that the read-compare-write
/// of a CAS is atomic. Lookups by source/target/status scan the relevant
/// directory.
pub struct JsonStorage {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStorage {
    /// Create storage, creating the data and meta subdirectories if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("tasks")).await?;
        fs::create_dir_all(root.join("edges")).await?;
        fs::create_dir_all(root.join("workflows")).await?;
        fs::create_dir_all(root.join("bindings")).await?;

        fs::create_dir_all(root.join("meta").join("tasks")).await?;
        fs::create_dir_all(root.join("meta").join("workflows")).await?;

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", id))
    }
    fn edge_path(&self, key: &EdgeKey) -> PathBuf {
        self.root.join("edges").join(format!("{}.json", key))
    }
    fn workflow_path(&self, id: WorkflowId) -> PathBuf {
        self.root.join("workflows").join(format!("{}.json", id))
    }
    fn binding_path(&self, binding: &StageBinding) -> PathBuf {
        self.root.join("bindings").join(format!(
            "{}_{}_{:04}.json",
            binding.workflow_id, binding.stage, binding.ordinal
        ))
    }

    fn meta_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join("meta").join(kind).join(format!("{}.meta.json", id))
    }

    /// Current revision recorded in the meta marker, if any.
    async fn read_version(&self, kind: &str, id: &str) -> Result<Option<u64>> {
        match fs::read_to_string(self.meta_path(kind, id)).await {
            Ok(s) => {
                let json: serde_json::Value = serde_json::from_str(&s)?;
                Ok(json.get("version").and_then(|v| v.as_u64()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_version(&self, kind: &str, id: &str, version: u64) -> Result<()> {
        let meta = serde_json::json!({"version": version, "updated_at": chrono::Utc::now()});
        write_atomic(&self.meta_path(kind, id), serde_json::to_string_pretty(&meta)?.as_bytes()).await
    }

    /// Write a versioned record if the marker matches `expected` (`None` = must not exist).
    async fn write_versioned<T: serde::Serialize>(
        &self,
        kind: &str,
        id: &str,
        path: &Path,
        expected: Option<u64>,
        version: u64,
        value: &T,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let current = self.read_version(kind, id).await?;
        if current != expected {
            debug!(kind, id, ?current, ?expected, "revision mismatch");
            return Ok(false);
        }
        write_atomic(path, serde_json::to_string_pretty(value)?.as_bytes()).await?;
        self.write_version(kind, id, version).await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Storage for JsonStorage {
    async fn insert_task(&self, task: &Task) -> Result<bool> {
        let id = task.id.to_string();
        self.write_versioned("tasks", &id, &self.task_path(task.id), None, task.version, task)
            .await
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>> {
        read_json(&self.task_path(id)).await
    }

    async fn compare_and_set_task(&self, expected_version: u64, task: &Task) -> Result<bool> {
        let id = task.id.to_string();
        self.write_versioned(
            "tasks",
            &id,
            &self.task_path(task.id),
            Some(expected_version),
            task.version,
            task,
        )
        .await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let all = list_dir(&self.root.join("tasks"), |_| true).await?;
        let mut tasks: Vec<Task> = all.into_iter().filter(|t: &Task| filter.matches(t)).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn insert_edge(&self, edge: &DependencyEdge) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.edge_path(&edge.key());
        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        write_atomic(&path, serde_json::to_string_pretty(edge)?.as_bytes()).await?;
        Ok(true)
    }

    async fn load_edge(&self, key: &EdgeKey) -> Result<Option<DependencyEdge>> {
        read_json(&self.edge_path(key)).await
    }

    async fn save_edge(&self, edge: &DependencyEdge) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = edge.key();
        let path = self.edge_path(&key);
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(format!("edge {}", key)));
        }
        write_atomic(&path, serde_json::to_string_pretty(edge)?.as_bytes()).await
    }

    async fn delete_edge(&self, key: &EdgeKey) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.edge_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn edges_from(&self, source: TaskId) -> Result<Vec<DependencyEdge>> {
        let prefix = format!("{}_", source);
        list_dir(&self.root.join("edges"), |name| name.starts_with(&prefix)).await
    }

    async fn edges_to(&self, target: TaskId) -> Result<Vec<DependencyEdge>> {
        let all: Vec<DependencyEdge> = list_dir(&self.root.join("edges"), |_| true).await?;
        Ok(all.into_iter().filter(|e| e.target_id == target).collect())
    }

    async fn insert_workflow(&self, workflow: &WorkflowExecution) -> Result<bool> {
        let id = workflow.id.to_string();
        let path = self.workflow_path(workflow.id);
        self.write_versioned("workflows", &id, &path, None, workflow.version, workflow)
            .await
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowExecution>> {
        read_json(&self.workflow_path(id)).await
    }

    async fn compare_and_set_workflow(
        &self,
        expected_version: u64,
        workflow: &WorkflowExecution,
    ) -> Result<bool> {
        let id = workflow.id.to_string();
        let path = self.workflow_path(workflow.id);
        self.write_versioned("workflows", &id, &path, Some(expected_version), workflow.version, workflow)
            .await
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowExecution>> {
        let mut workflows: Vec<WorkflowExecution> =
            list_dir(&self.root.join("workflows"), |_| true).await?;
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(workflows)
    }

    async fn save_binding(&self, binding: &StageBinding) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.binding_path(binding), serde_json::to_string_pretty(binding)?.as_bytes()).await
    }

    async fn list_bindings(
        &self,
        workflow_id: WorkflowId,
        stage: Option<WorkflowStage>,
    ) -> Result<Vec<StageBinding>> {
        let prefix = match stage {
            Some(stage) => format!("{}_{}_", workflow_id, stage),
            None => format!("{}_", workflow_id),
        };
        let mut bindings: Vec<StageBinding> =
            list_dir(&self.root.join("bindings"), |name| name.starts_with(&prefix)).await?;
        bindings.sort_by(|a, b| a.stage.cmp(&b.stage).then_with(|| a.ordinal.cmp(&b.ordinal)));
        Ok(bindings)
    }

    async fn bindings_for_task(&self, task_id: TaskId) -> Result<Vec<StageBinding>> {
        let all: Vec<StageBinding> = list_dir(&self.root.join("bindings"), |_| true).await?;
        Ok(all.into_iter().filter(|b| b.task_id == task_id).collect())
    }
}

/// Write through a temporary file so readers never see a partial record.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T, F>(dir: &Path, mut accept: F) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
    F: FnMut(&str) -> bool,
{
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !accept(name) {
            continue;
        }
        if let Some(item) = read_json(&path).await? {
            items.push(item);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use devflow_core::{ActorId, DependencyKind, OrganizationId, TaskSpec, TaskStatus};

    fn make_task(name: &str) -> Task {
        Task::from_spec(TaskSpec::new(OrganizationId::new("acme"), name), None, 3, Utc::now())
    }

    #[tokio::test]
    async fn test_task_round_trip_and_cas() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let task = make_task("a");

        assert!(storage.insert_task(&task).await.unwrap());
        assert!(!storage.insert_task(&task).await.unwrap());

        let mut updated = task.clone();
        updated.transition(TaskStatus::Assigned, &ActorId::new("w1"), Utc::now()).unwrap();
        assert!(storage.compare_and_set_task(task.version, &updated).await.unwrap());
        assert!(!storage.compare_and_set_task(task.version, &updated).await.unwrap());

        let loaded = storage.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Assigned);
        assert_eq!(loaded.version, updated.version);
    }

    #[tokio::test]
    async fn test_list_tasks_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let pending = make_task("pending");
        let mut draft = make_task("draft");
        draft.status = TaskStatus::Draft;
        storage.insert_task(&pending).await.unwrap();
        storage.insert_task(&draft).await.unwrap();

        let found = storage.list_tasks(&TaskFilter::with_status(TaskStatus::Pending)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, pending.id);
    }

    #[tokio::test]
    async fn test_edge_lookup_by_source_and_target() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let (a, b, c) = (TaskId::new(), TaskId::new(), TaskId::new());
        let now = Utc::now();

        storage.insert_edge(&DependencyEdge::new(a, b, DependencyKind::Hard, now)).await.unwrap();
        storage.insert_edge(&DependencyEdge::new(b, c, DependencyKind::Data, now)).await.unwrap();

        let from_a = storage.edges_from(a).await.unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].target_id, b);
        assert_eq!(storage.edges_to(c).await.unwrap().len(), 1);

        let mut edge = from_a[0].clone();
        edge.satisfy(Utc::now());
        storage.save_edge(&edge).await.unwrap();
        assert!(storage.load_edge(&edge.key()).await.unwrap().unwrap().is_satisfied);
    }

    #[tokio::test]
    async fn test_bindings_by_stage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let workflow_id = WorkflowId::new();
        for (stage, ordinal) in [(WorkflowStage::Validation, 1), (WorkflowStage::Validation, 0), (WorkflowStage::Completion, 0)] {
            storage
                .save_binding(&StageBinding {
                    workflow_id,
                    stage,
                    ordinal,
                    task_id: TaskId::new(),
                    required: true,
                    key_deliverable: false,
                    attempt: 0,
                })
                .await
                .unwrap();
        }

        let validation = storage.list_bindings(workflow_id, Some(WorkflowStage::Validation)).await.unwrap();
        assert_eq!(validation.iter().map(|b| b.ordinal).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(storage.list_bindings(workflow_id, None).await.unwrap().len(), 3);
    }
}
