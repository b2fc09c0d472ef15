//! Task scheduling: ready selection, claiming, and retry with backoff.

use std::sync::Arc;

use chrono::{Duration, Utc};
use devflow_core::{
    ActorId, BlockReason, DependencyKind, EventKind, Task, TaskFilter, TaskId, TaskStatus, Time,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dependency::DependencyGraph;
use crate::error::Result;
use crate::events::EventBus;
use crate::store::{TaskStore, DEFAULT_MAX_RETRIES};

/// Delay curve applied before a failed task is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "curve", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay every time
    Fixed {
        /// Delay in seconds
        delay_secs: u64,
    },
    /// `base * retry_count`, capped
    Linear {
        /// Step in seconds
        base_secs: u64,
        /// Upper bound in seconds
        max_secs: u64,
    },
    /// `base * 2^(retry_count - 1)`, capped
    Exponential {
        /// First delay in seconds
        base_secs: u64,
        /// Upper bound in seconds
        max_secs: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base_secs: 30,
            max_secs: 3600,
        }
    }
}

impl Backoff {
    /// No delay at all.
    pub fn none() -> Self {
        Backoff::Fixed { delay_secs: 0 }
    }

    /// Delay before the attempt following failure number `retry_count`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let n = u64::from(retry_count.max(1));
        let secs = match *self {
            Backoff::Fixed { delay_secs } => delay_secs,
            Backoff::Linear { base_secs, max_secs } => base_secs.saturating_mul(n).min(max_secs),
            Backoff::Exponential { base_secs, max_secs } => {
                let factor = 1u64.checked_shl((n - 1) as u32).unwrap_or(u64::MAX);
                base_secs.saturating_mul(factor).min(max_secs)
            }
        };
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retry budget for tasks that do not set their own
    pub default_max_retries: u32,
    /// Retry delay curve
    pub backoff: Backoff,
    /// Selection rounds in `claim_next_batch` before giving up on lost races
    pub claim_attempts: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
            claim_attempts: 3,
        }
    }
}

impl SchedulerConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backoff curve.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// What happened to a task after a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in `pending`, not before `scheduled_at`
    Retrying {
        /// Failures so far
        retry_count: u32,
        /// Earliest next attempt
        scheduled_at: Time,
    },
    /// Retry budget spent; the task is archived
    Exhausted {
        /// Failures so far
        retry_count: u32,
    },
}

/// Result of cancelling a task.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// The cancelled task
    pub task: Task,
    /// Hard dependents moved to `blocked`
    pub blocked: Vec<TaskId>,
}

/// Decides what runs next and applies retry policy.
pub struct TaskScheduler {
    store: Arc<TaskStore>,
    graph: Arc<DependencyGraph>,
    events: EventBus,
    config: SchedulerConfig,
}

impl TaskScheduler {
    /// Create a scheduler.
    pub fn new(store: Arc<TaskStore>, graph: Arc<DependencyGraph>, events: EventBus, config: SchedulerConfig) -> Self {
        Self {
            store,
            graph,
            events,
            config,
        }
    }

    /// Scheduler tuning.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Up to `limit` eligible pending tasks, highest priority first, FIFO
    /// within a priority.
    ///
    /// Returns immediately, possibly empty. Nothing is reserved: callers
    /// claim before doing work.
    pub async fn next_ready_batch(&self, limit: usize) -> Result<Vec<TaskId>> {
        self.next_ready_batch_matching(&TaskFilter::default(), limit).await
    }

    /// [`next_ready_batch`](Self::next_ready_batch) restricted by `filter`.
    pub async fn next_ready_batch_matching(&self, filter: &TaskFilter, limit: usize) -> Result<Vec<TaskId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut candidates: Vec<Task> = self
            .store
            .list_by_status(TaskStatus::Pending, filter)
            .await?
            .into_iter()
            .filter(|t| t.scheduled_at <= now)
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
                .then(a.id.cmp(&b.id))
        });

        let mut ready = Vec::new();
        for task in candidates {
            if ready.len() >= limit {
                break;
            }
            if self.graph.is_eligible(task.id).await? {
                ready.push(task.id);
            }
        }
        debug!("Ready batch: {} of limit {}", ready.len(), limit);
        Ok(ready)
    }

    /// Atomically move an eligible task from `pending` to `assigned`.
    ///
    /// `Ok(false)` means someone else got it or it is not claimable; the
    /// caller should select again.
    pub async fn claim(&self, task_id: TaskId, worker: &ActorId) -> Result<bool> {
        if !self.graph.is_eligible(task_id).await? {
            return Ok(false);
        }
        let claimed = self
            .store
            .transition_if(task_id, TaskStatus::Pending, TaskStatus::Assigned, worker, |_| {})
            .await?;
        match claimed {
            Some(_) => {
                info!("Worker {} claimed task {}", worker, task_id);
                Ok(true)
            }
            None => {
                debug!("Worker {} lost claim on task {}", worker, task_id);
                Ok(false)
            }
        }
    }

    /// Claim up to `limit` ready tasks, re-selecting after lost races.
    pub async fn claim_next_batch(&self, limit: usize, worker: &ActorId) -> Result<Vec<Task>> {
        let mut claimed = Vec::new();
        for _ in 0..self.config.claim_attempts.max(1) {
            let wanted = limit.saturating_sub(claimed.len());
            if wanted == 0 {
                break;
            }
            let batch = self.next_ready_batch(wanted).await?;
            if batch.is_empty() {
                break;
            }
            for id in batch {
                if self.claim(id, worker).await? {
                    claimed.push(self.store.get(id).await?);
                }
            }
        }
        Ok(claimed)
    }

    /// `assigned -> in_progress`.
    pub async fn start(&self, task_id: TaskId, actor: &ActorId) -> Result<Task> {
        self.store.update_status(task_id, TaskStatus::InProgress, actor).await
    }

    /// Complete a task and propagate satisfaction to its dependents.
    ///
    /// An in-progress task passes through `review`. Calling this on an already
    /// completed task only re-runs propagation.
    pub async fn on_task_completed(&self, task_id: TaskId, actor: &ActorId) -> Result<Vec<TaskId>> {
        let task = self.store.get(task_id).await?;
        if task.status == TaskStatus::InProgress {
            self.store.update_status(task_id, TaskStatus::Review, actor).await?;
        }
        if !task.succeeded() {
            self.store.update_status(task_id, TaskStatus::Completed, actor).await?;
        }
        self.graph.on_task_completed(task_id).await
    }

    /// Record a failure and either requeue with backoff or archive.
    pub async fn on_task_failed(&self, task_id: TaskId, error: &str) -> Result<FailureOutcome> {
        let actor = ActorId::system();
        let message = error.to_string();
        let failed = self
            .store
            .transition_with(task_id, TaskStatus::Failed, &actor, |t| {
                t.last_error = Some(message.clone());
            })
            .await?;

        if failed.retries_exhausted() {
            self.store.update_status(task_id, TaskStatus::Archived, &actor).await?;
            let blocked = self.block_failed_dependents(task_id, &actor).await?;
            warn!(
                "Task {} exhausted its retries ({} of {}), blocked {} dependents: {}",
                task_id,
                failed.retry_count,
                failed.max_retries,
                blocked.len(),
                error
            );
            self.publish_failure(&failed, error, true);
            return Ok(FailureOutcome::Exhausted {
                retry_count: failed.retry_count,
            });
        }

        let scheduled_at = Utc::now() + self.config.backoff.delay(failed.retry_count);
        self.store
            .transition_with(task_id, TaskStatus::Pending, &actor, |t| {
                t.scheduled_at = scheduled_at;
            })
            .await?;
        info!(
            "Task {} failed (attempt {}), retrying at {}",
            task_id, failed.retry_count, scheduled_at
        );
        self.publish_failure(&failed, error, false);
        Ok(FailureOutcome::Retrying {
            retry_count: failed.retry_count,
            scheduled_at,
        })
    }

    /// Fail a task terminally, bypassing the retry budget.
    ///
    /// Hard dependents are blocked, as after an exhausted retry budget.
    pub async fn abandon(&self, task_id: TaskId, error: &str) -> Result<Task> {
        let actor = ActorId::system();
        let message = error.to_string();
        let task = self.store.get(task_id).await?;
        let failed = if task.status == TaskStatus::Failed {
            task
        } else {
            self.store
                .transition_with(task_id, TaskStatus::Failed, &actor, |t| {
                    t.last_error = Some(message.clone());
                })
                .await?
        };
        let archived = self.store.update_status(task_id, TaskStatus::Archived, &actor).await?;
        self.block_failed_dependents(task_id, &actor).await?;
        warn!("Task {} abandoned: {}", task_id, error);
        self.publish_failure(&failed, error, true);
        Ok(archived)
    }

    /// Return a dependency-blocked task to `pending` if it is eligible again.
    pub async fn reevaluate(&self, task_id: TaskId) -> Result<bool> {
        let task = self.store.get(task_id).await?;
        let auto = task
            .block_reason
            .as_ref()
            .map_or(true, BlockReason::clears_automatically);
        if task.status != TaskStatus::Blocked || !auto {
            return Ok(false);
        }
        if !self.graph.is_eligible(task_id).await? {
            return Ok(false);
        }
        let moved = self
            .store
            .transition_if(task_id, TaskStatus::Blocked, TaskStatus::Pending, &ActorId::system(), |_| {})
            .await?;
        if moved.is_some() {
            info!("Task {} unblocked, dependencies satisfied", task_id);
        }
        Ok(moved.is_some())
    }

    /// Move a task to `blocked` with a reason.
    pub async fn block(&self, task_id: TaskId, reason: BlockReason, actor: &ActorId) -> Result<Task> {
        self.store
            .transition_with(task_id, TaskStatus::Blocked, actor, |t| {
                t.block_reason = Some(reason.clone());
            })
            .await
    }

    /// Operator release of a blocked task back to `pending`.
    pub async fn unblock(&self, task_id: TaskId, actor: &ActorId) -> Result<Task> {
        self.store.update_status(task_id, TaskStatus::Pending, actor).await
    }

    /// Cancel a task, drop its edges, and block its hard dependents.
    ///
    /// A task under review is sent back to `in_progress` first. Dependents
    /// that were waiting on it stay blocked until an operator intervenes.
    pub async fn cancel_task(&self, task_id: TaskId, actor: &ActorId) -> Result<CancelOutcome> {
        let task = self.store.get(task_id).await?;
        if task.status == TaskStatus::Cancelled {
            return Ok(CancelOutcome { task, blocked: Vec::new() });
        }
        if task.status == TaskStatus::Review {
            self.store.update_status(task_id, TaskStatus::InProgress, actor).await?;
        }

        let dependents = self.waiting_dependents(task_id).await?;
        let cancelled = self.store.update_status(task_id, TaskStatus::Cancelled, actor).await?;
        self.graph.remove_task(task_id).await?;

        let reason = BlockReason::PrerequisiteCancelled { task_id };
        let blocked = self.block_dependents(dependents, &reason, actor).await?;

        info!("Cancelled task {}, blocked {} dependents", task_id, blocked.len());
        Ok(CancelOutcome {
            task: cancelled,
            blocked,
        })
    }

    /// Sources of unsatisfied hard edges pointing at `task_id`.
    async fn waiting_dependents(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        Ok(self
            .graph
            .dependents_of(task_id)
            .await?
            .into_iter()
            .filter(|e| e.kind == DependencyKind::Hard && !e.is_satisfied)
            .map(|e| e.source_id)
            .collect())
    }

    async fn block_failed_dependents(&self, task_id: TaskId, actor: &ActorId) -> Result<Vec<TaskId>> {
        let dependents = self.waiting_dependents(task_id).await?;
        let reason = BlockReason::PrerequisiteFailed { task_id };
        self.block_dependents(dependents, &reason, actor).await
    }

    async fn block_dependents(
        &self,
        dependents: Vec<TaskId>,
        reason: &BlockReason,
        actor: &ActorId,
    ) -> Result<Vec<TaskId>> {
        let mut blocked = Vec::new();
        for dependent in dependents {
            if self.block_dependent(dependent, reason, actor).await? {
                blocked.push(dependent);
            }
        }
        Ok(blocked)
    }

    async fn block_dependent(&self, task_id: TaskId, reason: &BlockReason, actor: &ActorId) -> Result<bool> {
        let task = self.store.get(task_id).await?;
        match task.status {
            TaskStatus::Pending | TaskStatus::InProgress => {
                self.block(task_id, reason.clone(), actor).await?;
            }
            TaskStatus::Assigned => {
                self.store.update_status(task_id, TaskStatus::Pending, actor).await?;
                self.block(task_id, reason.clone(), actor).await?;
            }
            TaskStatus::Blocked => {
                let reason = reason.clone();
                self.store
                    .modify(task_id, move |t| {
                        t.block_reason = Some(reason.clone());
                        Ok(())
                    })
                    .await?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn publish_failure(&self, task: &Task, error: &str, exhausted: bool) {
        self.events.publish(EventKind::TaskFailed {
            task_id: task.id,
            error: error.to_string(),
            retry_count: task.retry_count,
            exhausted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::{Event, OrganizationId, Priority, TaskSpec};
    use devflow_storage::{MemoryStorage, Storage};
    use tokio::sync::broadcast;

    struct Fixture {
        store: Arc<TaskStore>,
        graph: Arc<DependencyGraph>,
        scheduler: Arc<TaskScheduler>,
        rx: broadcast::Receiver<Event>,
    }

    fn fixture() -> Fixture {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let events = EventBus::new();
        let rx = events.subscribe();
        let store = Arc::new(TaskStore::new(storage.clone(), events.clone()));
        let graph = Arc::new(DependencyGraph::new(storage, events.clone()));
        let config = SchedulerConfig::new().with_backoff(Backoff::none());
        let scheduler = Arc::new(TaskScheduler::new(store.clone(), graph.clone(), events, config));
        Fixture { store, graph, scheduler, rx }
    }

    fn spec(name: &str) -> TaskSpec {
        TaskSpec::new(OrganizationId::new("acme"), name)
    }

    async fn run_to_completion(f: &Fixture, id: TaskId) {
        let worker = ActorId::new("worker");
        assert!(f.scheduler.claim(id, &worker).await.unwrap());
        f.scheduler.start(id, &worker).await.unwrap();
        f.scheduler.on_task_completed(id, &worker).await.unwrap();
    }

    #[test]
    fn test_backoff_curves() {
        let fixed = Backoff::Fixed { delay_secs: 5 };
        assert_eq!(fixed.delay(7), Duration::seconds(5));

        let linear = Backoff::Linear { base_secs: 10, max_secs: 25 };
        assert_eq!(linear.delay(1), Duration::seconds(10));
        assert_eq!(linear.delay(2), Duration::seconds(20));
        assert_eq!(linear.delay(3), Duration::seconds(25));

        let exp = Backoff::default();
        assert_eq!(exp.delay(1), Duration::seconds(30));
        assert_eq!(exp.delay(2), Duration::seconds(60));
        assert_eq!(exp.delay(3), Duration::seconds(120));
        assert_eq!(exp.delay(200), Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_ready_batch_orders_by_priority_then_fifo() {
        let f = fixture();
        let t0 = Utc::now() - Duration::minutes(10);
        let low = f.store.create(spec("low").with_priority(Priority::Low).scheduled_at(t0)).await.unwrap();
        let late = f
            .store
            .create(spec("late").with_priority(Priority::High).scheduled_at(t0 + Duration::minutes(2)))
            .await
            .unwrap();
        let early = f
            .store
            .create(spec("early").with_priority(Priority::High).scheduled_at(t0 + Duration::minutes(1)))
            .await
            .unwrap();
        let critical = f
            .store
            .create(spec("critical").with_priority(Priority::Critical).scheduled_at(t0 + Duration::minutes(5)))
            .await
            .unwrap();

        let batch = f.scheduler.next_ready_batch(10).await.unwrap();
        assert_eq!(batch, vec![critical, early, late, low]);
        assert_eq!(f.scheduler.next_ready_batch(2).await.unwrap(), vec![critical, early]);
    }

    #[tokio::test]
    async fn test_ready_batch_skips_future_and_ineligible() {
        let f = fixture();
        let future = f.store.create(spec("future").scheduled_at(Utc::now() + Duration::hours(1))).await.unwrap();
        let a = f.store.create(spec("a")).await.unwrap();
        let b = f.store.create(spec("b")).await.unwrap();
        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();

        let batch = f.scheduler.next_ready_batch(10).await.unwrap();
        assert_eq!(batch, vec![b]);
        assert!(!batch.contains(&future));
    }

    #[tokio::test]
    async fn test_completion_unlocks_dependent() {
        let f = fixture();
        let a = f.store.create(spec("a")).await.unwrap();
        let b = f.store.create(spec("b")).await.unwrap();
        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        assert!(!f.scheduler.next_ready_batch(10).await.unwrap().contains(&a));

        run_to_completion(&f, b).await;

        assert!(f.graph.is_eligible(a).await.unwrap());
        assert!(f.scheduler.next_ready_batch(10).await.unwrap().contains(&a));
        let completed = f.store.get(b).await.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_rejects_ineligible() {
        let f = fixture();
        let a = f.store.create(spec("a")).await.unwrap();
        let b = f.store.create(spec("b")).await.unwrap();
        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        assert!(!f.scheduler.claim(a, &ActorId::new("w")).await.unwrap());
        assert_eq!(f.store.get(a).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_archives() {
        let mut f = fixture();
        let worker = ActorId::new("worker");
        let x = f.store.create(spec("x").with_max_retries(2).as_draft()).await.unwrap();
        f.store.update_status(x, TaskStatus::Pending, &worker).await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            assert!(f.scheduler.claim(x, &worker).await.unwrap());
            f.scheduler.start(x, &worker).await.unwrap();
            outcomes.push(f.scheduler.on_task_failed(x, "boom").await.unwrap());
        }

        assert!(matches!(outcomes[0], FailureOutcome::Retrying { retry_count: 1, .. }));
        assert!(matches!(outcomes[1], FailureOutcome::Retrying { retry_count: 2, .. }));
        assert_eq!(outcomes[2], FailureOutcome::Exhausted { retry_count: 3 });

        let task = f.store.get(x).await.unwrap();
        assert_eq!(task.status, TaskStatus::Archived);
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert!(task.terminally_failed());
        assert!(f.scheduler.next_ready_batch(10).await.unwrap().is_empty());

        let mut exhausted = 0;
        while let Ok(event) = f.rx.try_recv() {
            if let EventKind::TaskFailed { exhausted: true, .. } = event.kind {
                exhausted += 1;
            }
        }
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn test_failure_applies_backoff() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let events = EventBus::new();
        let store = Arc::new(TaskStore::new(storage.clone(), events.clone()));
        let graph = Arc::new(DependencyGraph::new(storage, events.clone()));
        let scheduler = TaskScheduler::new(store.clone(), graph, events, SchedulerConfig::default());
        let worker = ActorId::new("worker");

        let id = store.create(spec("x")).await.unwrap();
        scheduler.claim(id, &worker).await.unwrap();
        scheduler.start(id, &worker).await.unwrap();
        let outcome = scheduler.on_task_failed(id, "flaky").await.unwrap();

        match outcome {
            FailureOutcome::Retrying { scheduled_at, .. } => assert!(scheduled_at > Utc::now()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Pending);
        assert!(scheduler.next_ready_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claim_has_single_winner() {
        let f = fixture();
        let id = f.store.create(spec("only")).await.unwrap();

        let s1 = f.scheduler.clone();
        let s2 = f.scheduler.clone();
        let w1 = tokio::spawn(async move {
            let batch = s1.next_ready_batch(1).await.unwrap();
            let mut won = Vec::new();
            for id in batch {
                if s1.claim(id, &ActorId::new("w1")).await.unwrap() {
                    won.push(id);
                }
            }
            won
        });
        let w2 = tokio::spawn(async move {
            let batch = s2.next_ready_batch(1).await.unwrap();
            let mut won = Vec::new();
            for id in batch {
                if s2.claim(id, &ActorId::new("w2")).await.unwrap() {
                    won.push(id);
                }
            }
            won
        });
        let (r1, r2) = tokio::join!(w1, w2);
        let (r1, r2) = (r1.unwrap(), r2.unwrap());

        assert_eq!(r1.len() + r2.len(), 1);
        assert_eq!(f.store.get(id).await.unwrap().status, TaskStatus::Assigned);
        assert!(f.scheduler.next_ready_batch(1).await.unwrap().is_empty());
        assert!(f.scheduler.claim_next_batch(1, &ActorId::new("w3")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_next_batch() {
        let f = fixture();
        for i in 0..3 {
            f.store.create(spec(&format!("t{}", i))).await.unwrap();
        }
        let worker = ActorId::new("w");
        let claimed = f.scheduler.claim_next_batch(2, &worker).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|t| t.status == TaskStatus::Assigned));
        assert!(claimed.iter().all(|t| t.assigned_to.as_ref() == Some(&worker)));
        assert_eq!(f.scheduler.next_ready_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_blocks_dependents() {
        let f = fixture();
        let worker = ActorId::new("worker");
        let pre = f.store.create(spec("pre")).await.unwrap();
        let waiting = f.store.create(spec("waiting")).await.unwrap();
        let done = f.store.create(spec("done")).await.unwrap();
        f.graph.add_dependency(waiting, pre, DependencyKind::Hard).await.unwrap();
        f.graph.add_dependency(done, pre, DependencyKind::Soft).await.unwrap();

        let outcome = f.scheduler.cancel_task(pre, &worker).await.unwrap();
        assert_eq!(outcome.task.status, TaskStatus::Cancelled);
        assert_eq!(outcome.blocked, vec![waiting]);

        let blocked = f.store.get(waiting).await.unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert_eq!(blocked.block_reason, Some(BlockReason::PrerequisiteCancelled { task_id: pre }));
        assert!(f.graph.dependencies_of(waiting).await.unwrap().is_empty());

        // Eligible again, but a cancelled prerequisite needs an operator.
        assert!(!f.scheduler.reevaluate(waiting).await.unwrap());
        f.scheduler.unblock(waiting, &worker).await.unwrap();
        assert_eq!(f.store.get(waiting).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(f.store.get(done).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_reevaluate_lifts_dependency_block() {
        let f = fixture();
        let worker = ActorId::new("worker");
        let a = f.store.create(spec("a")).await.unwrap();
        let b = f.store.create(spec("b")).await.unwrap();
        f.graph.add_dependency(a, b, DependencyKind::Hard).await.unwrap();
        f.scheduler.block(a, BlockReason::Dependencies, &worker).await.unwrap();

        assert!(!f.scheduler.reevaluate(a).await.unwrap());
        run_to_completion(&f, b).await;
        assert!(f.scheduler.reevaluate(a).await.unwrap());

        let task = f.store.get(a).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.block_reason.is_none());
    }

    #[tokio::test]
    async fn test_abandon_skips_retries() {
        let f = fixture();
        let worker = ActorId::new("worker");
        let id = f.store.create(spec("x")).await.unwrap();
        f.scheduler.claim(id, &worker).await.unwrap();
        f.scheduler.start(id, &worker).await.unwrap();

        let task = f.scheduler.abandon(id, "unsupported").await.unwrap();
        assert_eq!(task.status, TaskStatus::Archived);
        assert!(task.terminally_failed());
    }

    #[tokio::test]
    async fn test_exhausted_prerequisite_blocks_dependents() {
        let f = fixture();
        let worker = ActorId::new("worker");
        let pre = f.store.create(spec("pre").with_max_retries(0)).await.unwrap();
        let waiting = f.store.create(spec("waiting")).await.unwrap();
        let soft = f.store.create(spec("soft")).await.unwrap();
        f.graph.add_dependency(waiting, pre, DependencyKind::Hard).await.unwrap();
        f.graph.add_dependency(soft, pre, DependencyKind::Soft).await.unwrap();

        assert!(f.scheduler.claim(pre, &worker).await.unwrap());
        f.scheduler.start(pre, &worker).await.unwrap();
        let outcome = f.scheduler.on_task_failed(pre, "boom").await.unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted { retry_count: 1 });

        let blocked = f.store.get(waiting).await.unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert_eq!(blocked.block_reason, Some(BlockReason::PrerequisiteFailed { task_id: pre }));
        assert!(!f.scheduler.reevaluate(waiting).await.unwrap());
        assert_eq!(f.store.get(soft).await.unwrap().status, TaskStatus::Pending);

        // The operator drops the dead edge and releases the task.
        f.graph.remove_dependency(waiting, pre, DependencyKind::Hard).await.unwrap();
        f.scheduler.unblock(waiting, &worker).await.unwrap();
        let ready = f.scheduler.next_ready_batch(10).await.unwrap();
        assert_eq!(ready.len(), 2);
        assert!(ready.contains(&waiting) && ready.contains(&soft));
    }

    #[tokio::test]
    async fn test_abandon_blocks_dependents() {
        let f = fixture();
        let worker = ActorId::new("worker");
        let pre = f.store.create(spec("pre")).await.unwrap();
        let waiting = f.store.create(spec("waiting")).await.unwrap();
        f.graph.add_dependency(waiting, pre, DependencyKind::Hard).await.unwrap();

        f.scheduler.claim(pre, &worker).await.unwrap();
        f.scheduler.start(pre, &worker).await.unwrap();
        f.scheduler.abandon(pre, "unsupported").await.unwrap();

        let blocked = f.store.get(waiting).await.unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert_eq!(blocked.block_reason, Some(BlockReason::PrerequisiteFailed { task_id: pre }));
    }
}
