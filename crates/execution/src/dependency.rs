//! Dependency graph manager.
//!
//! Edges point from the dependent task to its prerequisite: `S -> T` means
//! S cannot start until T completes. Only hard edges gate scheduling and only
//! hard edges take part in the cycle check.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use devflow_core::{DependencyEdge, DependencyKind, EdgeKey, EventKind, Task, TaskId};
use devflow_storage::Storage;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{OrchestrationError, Result};
use crate::events::EventBus;

/// Graph tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Deepest hard-edge chain the reachability search will follow.
    /// Anything deeper is treated as a cycle.
    pub max_depth: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self { max_depth: 1000 }
    }
}

/// Outcome of a bounded reachability search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reach {
    Found,
    NotFound,
    DepthExceeded,
}

/// Maintains dependency edges and their satisfaction.
pub struct DependencyGraph {
    storage: Arc<dyn Storage>,
    events: EventBus,
    config: GraphConfig,
    /// Serializes edge mutations so the cycle check sees a stable graph.
    write_zone: Mutex<()>,
}

impl DependencyGraph {
    /// Create a graph manager over `storage`.
    pub fn new(storage: Arc<dyn Storage>, events: EventBus) -> Self {
        Self::with_config(storage, events, GraphConfig::default())
    }

    /// Create a graph manager with explicit tuning.
    pub fn with_config(storage: Arc<dyn Storage>, events: EventBus, config: GraphConfig) -> Self {
        Self {
            storage,
            events,
            config,
            write_zone: Mutex::new(()),
        }
    }

    /// Record that `source` depends on `target`.
    ///
    /// Rejected with [`OrchestrationError::CyclicDependency`] on self-reference,
    /// or for hard edges when `target` already reaches `source`. A hard edge
    /// onto a cancelled or terminally failed target could never be satisfied
    /// and is rejected as a validation error. Either the edge is stored or
    /// nothing changes.
    pub async fn add_dependency(
        &self,
        source: TaskId,
        target: TaskId,
        kind: DependencyKind,
    ) -> Result<DependencyEdge> {
        if source == target {
            warn!("Rejected self-dependency on task {}", source);
            return Err(OrchestrationError::CyclicDependency { source_id: source, target_id: target });
        }

        let _zone = self.write_zone.lock().await;

        let source_task = self.live_task(source).await?;
        let target_task = self.live_task(target).await?;
        if source_task.organization_id != target_task.organization_id {
            return Err(OrchestrationError::Validation(format!(
                "tasks {} and {} belong to different organizations",
                source, target
            )));
        }
        if kind.gates_scheduling() && target_task.terminally_failed() {
            warn!("Rejected dependency {} -> {}: prerequisite is {}", source, target, target_task.status);
            return Err(OrchestrationError::Validation(format!(
                "task {} is {} and can never satisfy a hard dependency",
                target, target_task.status
            )));
        }

        let key = EdgeKey { source_id: source, target_id: target, kind };
        if let Some(existing) = self.storage.load_edge(&key).await? {
            debug!("Dependency {} already present", key);
            return Ok(existing);
        }

        if kind.gates_scheduling() {
            match self.reaches(target, source).await? {
                Reach::NotFound => {}
                Reach::Found => {
                    warn!("Rejected dependency {} -> {}: would close a cycle", source, target);
                    return Err(OrchestrationError::CyclicDependency { source_id: source, target_id: target });
                }
                Reach::DepthExceeded => {
                    warn!(
                        "Rejected dependency {} -> {}: hard chain deeper than {}",
                        source, target, self.config.max_depth
                    );
                    return Err(OrchestrationError::CyclicDependency { source_id: source, target_id: target });
                }
            }
        }

        let now = Utc::now();
        let mut edge = DependencyEdge::new(source, target, kind, now);
        if kind.satisfied_by_completion() && target_task.succeeded() {
            edge.satisfy(now);
        }

        if !self.storage.insert_edge(&edge).await? {
            // Only possible if someone bypassed the write zone.
            return Err(OrchestrationError::Conflict(format!("edge {}", key)));
        }
        info!("Added {} dependency {} -> {}", kind, source, target);
        Ok(edge)
    }

    /// Drop a single edge. Returns whether it existed.
    pub async fn remove_dependency(&self, source: TaskId, target: TaskId, kind: DependencyKind) -> Result<bool> {
        let _zone = self.write_zone.lock().await;
        let removed = self
            .storage
            .delete_edge(&EdgeKey { source_id: source, target_id: target, kind })
            .await?;
        if removed {
            info!("Removed {} dependency {} -> {}", kind, source, target);
        }
        Ok(removed)
    }

    /// Mark every hard and soft edge pointing at `task_id` satisfied.
    ///
    /// Idempotent. Returns the sources whose edges changed, each of which
    /// also gets a `DependencySatisfied` event.
    pub async fn on_task_completed(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        let task = self
            .storage
            .load_task(task_id)
            .await?
            .ok_or(OrchestrationError::TaskNotFound(task_id))?;
        if !task.succeeded() {
            return Err(OrchestrationError::Validation(format!(
                "task {} is {} and has not completed",
                task_id, task.status
            )));
        }

        let _zone = self.write_zone.lock().await;
        let now = Utc::now();
        let mut affected = Vec::new();

        for mut edge in self.storage.edges_to(task_id).await? {
            if !edge.kind.satisfied_by_completion() {
                continue;
            }
            if edge.satisfy(now) {
                self.storage.save_edge(&edge).await?;
                debug!("Satisfied {}", edge.key());
                self.events.publish(EventKind::DependencySatisfied {
                    source_id: edge.source_id,
                    target_id: edge.target_id,
                });
                affected.push(edge.source_id);
            }
        }

        if !affected.is_empty() {
            info!("Completion of {} satisfied {} dependencies", task_id, affected.len());
        }
        Ok(affected)
    }

    /// Whether every hard dependency of `task_id` is satisfied.
    pub async fn is_eligible(&self, task_id: TaskId) -> Result<bool> {
        Ok(self.unsatisfied_hard_dependencies(task_id).await?.is_empty())
    }

    /// Prerequisites still gating `task_id`.
    pub async fn unsatisfied_hard_dependencies(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        Ok(self
            .storage
            .edges_from(task_id)
            .await?
            .into_iter()
            .filter(|e| e.kind.gates_scheduling() && !e.is_satisfied)
            .map(|e| e.target_id)
            .collect())
    }

    /// Edges where `task_id` is the dependent.
    pub async fn dependencies_of(&self, task_id: TaskId) -> Result<Vec<DependencyEdge>> {
        Ok(self.storage.edges_from(task_id).await?)
    }

    /// Edges where `task_id` is the prerequisite.
    pub async fn dependents_of(&self, task_id: TaskId) -> Result<Vec<DependencyEdge>> {
        Ok(self.storage.edges_to(task_id).await?)
    }

    /// Delete every edge touching `task_id`, returning what was removed.
    pub async fn remove_task(&self, task_id: TaskId) -> Result<Vec<DependencyEdge>> {
        let _zone = self.write_zone.lock().await;

        let mut edges = self.storage.edges_from(task_id).await?;
        edges.extend(self.storage.edges_to(task_id).await?);

        let mut removed = Vec::with_capacity(edges.len());
        for edge in edges {
            if self.storage.delete_edge(&edge.key()).await? {
                removed.push(edge);
            }
        }
        if !removed.is_empty() {
            info!("Removed {} edges of task {}", removed.len(), task_id);
        }
        Ok(removed)
    }

    /// Breadth-first search along hard edges from `from`, looking for `goal`.
    async fn reaches(&self, from: TaskId, goal: TaskId) -> Result<Reach> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(from);
        queue.push_back((from, 0usize));

        while let Some((current, depth)) = queue.pop_front() {
            for edge in self.storage.edges_from(current).await? {
                if !edge.kind.gates_scheduling() {
                    continue;
                }
                let next = edge.target_id;
                if next == goal {
                    return Ok(Reach::Found);
                }
                if !visited.insert(next) {
                    continue;
                }
                if depth + 1 >= self.config.max_depth {
                    return Ok(Reach::DepthExceeded);
                }
                queue.push_back((next, depth + 1));
            }
        }
        Ok(Reach::NotFound)
    }

    async fn live_task(&self, id: TaskId) -> Result<Task> {
        match self.storage.load_task(id).await? {
            Some(task) if !task.is_deleted() => Ok(task),
            _ => Err(OrchestrationError::TaskNotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::{ActorId, OrganizationId, TaskSpec, TaskStatus};
    use devflow_storage::MemoryStorage;

    use crate::store::TaskStore;

    struct Fixture {
        store: TaskStore,
        graph: DependencyGraph,
    }

    fn fixture() -> Fixture {
        fixture_with(GraphConfig::default())
    }

    fn fixture_with(config: GraphConfig) -> Fixture {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let events = EventBus::new();
        Fixture {
            store: TaskStore::new(storage.clone(), events.clone()),
            graph: DependencyGraph::with_config(storage, events, config),
        }
    }

    async fn task(f: &Fixture, name: &str) -> TaskId {
        f.store.create(TaskSpec::new(OrganizationId::new("acme"), name)).await.unwrap()
    }

    async fn complete(f: &Fixture, id: TaskId) {
        let actor = ActorId::new("worker");
        for status in [TaskStatus::Assigned, TaskStatus::InProgress, TaskStatus::Review, TaskStatus::Completed] {
            f.store.update_status(id, status, &actor).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_three_cycle_rejected_and_graph_unchanged() {
        let f = fixture();
        let (a, b, c) = (task(&f, "a").await, task(&f, "b").await, task(&f, "c").await);

        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        f.graph.add_dependency(b, c, DependencyKind::Hard).await.unwrap();
        let err = f.graph.add_dependency(c, a, DependencyKind::Hard).await.unwrap_err();

        assert!(matches!(err, OrchestrationError::CyclicDependency { .. }));
        assert!(f.graph.dependencies_of(c).await.unwrap().is_empty());
        assert_eq!(f.graph.dependents_of(a).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_self_dependency_rejected_for_every_kind() {
        let f = fixture();
        let a = task(&f, "a").await;
        for kind in [DependencyKind::Hard, DependencyKind::Soft, DependencyKind::Resource, DependencyKind::Data] {
            let err = f.graph.add_dependency(a, a, kind).await.unwrap_err();
            assert!(matches!(err, OrchestrationError::CyclicDependency { .. }));
        }
    }

    #[tokio::test]
    async fn test_soft_edges_skip_cycle_check() {
        let f = fixture();
        let (a, b) = (task(&f, "a").await, task(&f, "b").await);

        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        f.graph.add_dependency(b, a, DependencyKind::Soft).await.unwrap();
        assert!(f.graph.add_dependency(b, a, DependencyKind::Hard).await.is_err());
    }

    #[tokio::test]
    async fn test_identical_edge_is_idempotent() {
        let f = fixture();
        let (a, b) = (task(&f, "a").await, task(&f, "b").await);

        let first = f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        let second = f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        assert_eq!(first.key(), second.key());
        assert_eq!(f.graph.dependencies_of(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_task_rejected() {
        let f = fixture();
        let a = task(&f, "a").await;
        let err = f.graph.add_dependency(a, TaskId::new(), DependencyKind::Hard).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_depth_limit_treated_as_cycle() {
        let f = fixture_with(GraphConfig { max_depth: 3 });
        let mut chain = Vec::new();
        for i in 0..5 {
            chain.push(task(&f, &format!("t{}", i)).await);
        }
        for pair in chain.windows(2) {
            f.graph.add_dependency(pair[0], pair[1], DependencyKind::Hard).await.unwrap();
        }

        let extra = task(&f, "extra").await;
        let err = f.graph.add_dependency(extra, chain[0], DependencyKind::Hard).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::CyclicDependency { .. }));
    }

    #[tokio::test]
    async fn test_completion_makes_dependent_eligible() {
        let f = fixture();
        let (a, b) = (task(&f, "a").await, task(&f, "b").await);
        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        assert!(!f.graph.is_eligible(a).await.unwrap());
        assert_eq!(f.graph.unsatisfied_hard_dependencies(a).await.unwrap(), vec![b]);

        complete(&f, b).await;
        let affected = f.graph.on_task_completed(b).await.unwrap();
        assert_eq!(affected, vec![a]);
        assert!(f.graph.is_eligible(a).await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_propagation_is_idempotent() {
        let f = fixture();
        let (a, b, c) = (task(&f, "a").await, task(&f, "b").await, task(&f, "c").await);
        f.graph.add_dependency(a, c, DependencyKind::Hard).await.unwrap();
        f.graph.add_dependency(b, c, DependencyKind::Soft).await.unwrap();
        complete(&f, c).await;

        let first = f.graph.on_task_completed(c).await.unwrap();
        let snapshot: Vec<_> = f.graph.dependents_of(c).await.unwrap();
        let second = f.graph.on_task_completed(c).await.unwrap();

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(snapshot, f.graph.dependents_of(c).await.unwrap());
    }

    #[tokio::test]
    async fn test_resource_edges_never_satisfied_or_gating() {
        let f = fixture();
        let (a, b) = (task(&f, "a").await, task(&f, "b").await);
        f.graph.add_dependency(a, b, DependencyKind::Resource).await.unwrap();
        assert!(f.graph.is_eligible(a).await.unwrap());

        complete(&f, b).await;
        assert!(f.graph.on_task_completed(b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edge_to_completed_target_starts_satisfied() {
        let f = fixture();
        let (a, b) = (task(&f, "a").await, task(&f, "b").await);
        complete(&f, b).await;

        let edge = f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        assert!(edge.is_satisfied);
        assert!(f.graph.is_eligible(a).await.unwrap());
    }

    #[tokio::test]
    async fn test_hard_edge_to_dead_target_rejected() {
        let f = fixture();
        let actor = ActorId::new("worker");
        let (a, cancelled, archived) = (task(&f, "a").await, task(&f, "cancelled").await, task(&f, "archived").await);
        f.store.update_status(cancelled, TaskStatus::Cancelled, &actor).await.unwrap();
        for status in [TaskStatus::Assigned, TaskStatus::InProgress, TaskStatus::Failed, TaskStatus::Archived] {
            f.store.update_status(archived, status, &actor).await.unwrap();
        }

        for target in [cancelled, archived] {
            let err = f.graph.add_dependency(a, target, DependencyKind::Hard).await.unwrap_err();
            assert!(matches!(err, OrchestrationError::Validation(_)));
        }
        assert!(f.graph.dependencies_of(a).await.unwrap().is_empty());
        assert!(f.graph.is_eligible(a).await.unwrap());

        // Soft edges never gate, so they may still point at a dead task.
        f.graph.add_dependency(a, cancelled, DependencyKind::Soft).await.unwrap();
    }

    #[tokio::test]
    async fn test_unrelated_edges_keep_eligibility() {
        let f = fixture();
        let (a, b, c, d) = (task(&f, "a").await, task(&f, "b").await, task(&f, "c").await, task(&f, "d").await);
        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        complete(&f, b).await;
        f.graph.on_task_completed(b).await.unwrap();
        assert!(f.graph.is_eligible(a).await.unwrap());

        f.graph.add_dependency(c, d, DependencyKind::Hard).await.unwrap();
        f.graph.add_dependency(d, b, DependencyKind::Hard).await.unwrap();
        assert!(f.graph.is_eligible(a).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_task_cascades() {
        let f = fixture();
        let (a, b, c) = (task(&f, "a").await, task(&f, "b").await, task(&f, "c").await);
        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        f.graph.add_dependency(b, c, DependencyKind::Data).await.unwrap();

        let removed = f.graph.remove_task(b).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(f.graph.dependencies_of(a).await.unwrap().is_empty());
        assert!(f.graph.dependents_of(c).await.unwrap().is_empty());
        assert!(f.graph.is_eligible(a).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_dependency() {
        let f = fixture();
        let (a, b) = (task(&f, "a").await, task(&f, "b").await);
        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();

        assert!(f.graph.remove_dependency(a, b, DependencyKind::Hard).await.unwrap());
        assert!(!f.graph.remove_dependency(a, b, DependencyKind::Hard).await.unwrap());
        f.graph.add_dependency(b, a, DependencyKind::Hard).await.unwrap();
    }

    #[tokio::test]
    async fn test_random_insertions_stay_acyclic() {
        let f = fixture();
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(task(&f, &format!("t{}", i)).await);
        }

        // Deterministic pseudo-random pair sequence.
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut accepted = Vec::new();
        for _ in 0..60 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let s = ids[(seed % 8) as usize];
            let t = ids[((seed >> 8) % 8) as usize];
            if f.graph.add_dependency(s, t, DependencyKind::Hard).await.is_ok() {
                accepted.push((s, t));
            }
        }

        // Kahn's algorithm must consume every node.
        let mut indegree = std::collections::HashMap::new();
        for id in &ids {
            indegree.insert(*id, 0usize);
        }
        let mut unique: Vec<_> = accepted.clone();
        unique.sort();
        unique.dedup();
        for (_, t) in &unique {
            *indegree.get_mut(t).unwrap() += 1;
        }
        let mut ready: Vec<_> = indegree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
        let mut seen = 0;
        while let Some(n) = ready.pop() {
            seen += 1;
            for (s, t) in &unique {
                if *s == n {
                    let d = indegree.get_mut(t).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        ready.push(*t);
                    }
                }
            }
        }
        assert_eq!(seen, ids.len());
    }
}
