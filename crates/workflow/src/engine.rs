//! Workflow stage engine.
//!
//! Drives a workflow through the fixed stage sequence. Each stage binds the
//! tasks its policy names; the workflow advances only once every bound task
//! is terminal, and a required task that failed for good sends it to `error`.
//! Decisions for one workflow are serialized by a per-workflow lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use chrono::{Duration, Utc};
use devflow_core::{
    ActorId, DependencyKind, EventKind, OrganizationId, StageBinding, StageOutcome, Task, TaskId,
    TaskSpec, TaskStatus, Time, WorkflowExecution, WorkflowId, WorkflowStage, WorkflowStatus,
};
use devflow_execution::{DependencyGraph, EventBus, OrchestrationError, TaskScheduler, TaskStore};
use devflow_storage::Storage;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkflowError};
use crate::stage::{Blueprint, TaskTemplate};

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Stage retries allowed per workflow
    pub max_retries: u32,
    /// Advance automatically when a bound task finishes
    pub auto_advance: bool,
    /// Per-stage timeout overrides in seconds, keyed by stage name
    pub timeout_secs: BTreeMap<String, u64>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            auto_advance: true,
            timeout_secs: BTreeMap::new(),
        }
    }
}

impl WorkflowConfig {
    /// Configured override for `stage`.
    pub fn timeout_override(&self, stage: WorkflowStage) -> Option<u64> {
        self.timeout_secs.get(stage.as_str()).copied()
    }
}

/// Outcome of [`WorkflowEngine::advance`] and friends.
#[derive(Debug, Clone, PartialEq)]
pub enum StageTransitionResult {
    /// Moved forward one stage
    Advanced {
        /// Stage left
        from: WorkflowStage,
        /// Stage entered
        to: WorkflowStage,
        /// Tasks bound to the new stage
        bound: Vec<TaskId>,
    },
    /// Bound tasks are still running
    NotReady {
        /// Current stage
        stage: WorkflowStage,
        /// Tasks not yet terminal
        pending: Vec<TaskId>,
    },
    /// A required task failed for good
    EnteredError {
        /// Stage that failed
        stage: WorkflowStage,
        /// Why
        reason: String,
        /// Required tasks that failed
        failed: Vec<TaskId>,
    },
    /// The final stage finished
    Completed,
    /// Re-entered the failed stage
    Retried {
        /// Stage re-entered
        stage: WorkflowStage,
        /// New tasks standing in for terminally failed ones
        replaced: Vec<TaskId>,
        /// Blocked tasks returned to `pending`
        requeued: Vec<TaskId>,
    },
}

/// Where a new task is bound.
#[derive(Debug, Clone, Copy)]
struct Slot {
    workflow_id: WorkflowId,
    stage: WorkflowStage,
    ordinal: u32,
    required: bool,
    key_deliverable: bool,
    attempt: u32,
}

impl Slot {
    fn bind(self, task_id: TaskId) -> StageBinding {
        StageBinding {
            workflow_id: self.workflow_id,
            stage: self.stage,
            ordinal: self.ordinal,
            task_id,
            required: self.required,
            key_deliverable: self.key_deliverable,
            attempt: self.attempt,
        }
    }
}

#[derive(Debug, Default)]
struct StageReport {
    pending: Vec<TaskId>,
    failed_required: Vec<TaskId>,
    tolerated: Vec<TaskId>,
}

/// Workflow stage state machine over the task layer.
pub struct WorkflowEngine {
    storage: Arc<dyn Storage>,
    store: Arc<TaskStore>,
    graph: Arc<DependencyGraph>,
    scheduler: Arc<TaskScheduler>,
    events: EventBus,
    blueprint: Blueprint,
    config: WorkflowConfig,
    /// Held only while an operation runs; dead entries are pruned.
    locks: Mutex<HashMap<WorkflowId, Weak<Mutex<()>>>>,
}

impl WorkflowEngine {
    /// Create an engine.
    pub fn new(
        storage: Arc<dyn Storage>,
        store: Arc<TaskStore>,
        graph: Arc<DependencyGraph>,
        scheduler: Arc<TaskScheduler>,
        events: EventBus,
        blueprint: Blueprint,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            storage,
            store,
            graph,
            scheduler,
            events,
            blueprint,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Engine tuning.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Stage policies.
    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    /// Register a new unit of work in `draft`.
    pub async fn create_workflow(
        &self,
        organization_id: OrganizationId,
        name: &str,
        actor: &ActorId,
    ) -> Result<WorkflowExecution> {
        if name.trim().is_empty() {
            return Err(OrchestrationError::Validation("workflow name must not be empty".into()).into());
        }
        let workflow = WorkflowExecution::new(organization_id, name, self.config.max_retries, actor.clone(), Utc::now());
        if !self.storage.insert_workflow(&workflow).await? {
            return Err(OrchestrationError::Conflict(format!("workflow {}", workflow.id)).into());
        }
        info!("Created workflow {} '{}'", workflow.id, workflow.name);
        Ok(workflow)
    }

    /// `draft -> active`, binding the first stage's tasks.
    pub async fn start(&self, id: WorkflowId) -> Result<WorkflowExecution> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut wf = self.load(id).await?;
        require_status(&wf, WorkflowStatus::Draft, "start")?;
        let expected = wf.version;
        let now = Utc::now();

        let stage = WorkflowStage::first();
        let drafts = self.draft_tasks(self.plan_stage(&wf, stage), &[]).await?;
        wf.enter_stage(stage, now);
        wf.status = WorkflowStatus::Active;
        wf.touch(now);
        let bound = self.commit_drafts(expected, &wf, &drafts).await?;

        info!("Started workflow {} at {} with {} tasks", id, stage, bound.len());
        Ok(wf)
    }

    /// `active -> paused`. Running tasks are left alone.
    pub async fn pause(&self, id: WorkflowId) -> Result<WorkflowExecution> {
        self.set_status(id, WorkflowStatus::Active, WorkflowStatus::Paused, "pause").await
    }

    /// `paused -> active`.
    pub async fn resume(&self, id: WorkflowId) -> Result<WorkflowExecution> {
        self.set_status(id, WorkflowStatus::Paused, WorkflowStatus::Active, "resume").await
    }

    /// Try to move to the next stage.
    ///
    /// Returns `NotReady` while bound tasks are still running. A required
    /// task that failed terminally sends the workflow to `error` right away,
    /// even if siblings are still in flight.
    pub async fn advance(&self, id: WorkflowId) -> Result<StageTransitionResult> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut wf = self.load(id).await?;
        require_status(&wf, WorkflowStatus::Active, "advance")?;
        let from = wf.current_stage;
        if from == WorkflowStage::Error {
            return Err(WorkflowError::InvalidStageTransition {
                workflow_id: id,
                from,
                to: wf.failed_stage.and_then(WorkflowStage::next).unwrap_or(WorkflowStage::Completion),
            });
        }

        let report = self.evaluate(id, from).await?;
        if !report.failed_required.is_empty() {
            let names: Vec<String> = report.failed_required.iter().map(|t| t.to_string()).collect();
            let reason = format!("required tasks failed: {}", names.join(", "));
            self.enter_error(&mut wf, &reason, Utc::now()).await?;
            return Ok(StageTransitionResult::EnteredError {
                stage: from,
                reason,
                failed: report.failed_required,
            });
        }
        if !report.pending.is_empty() {
            debug!("Workflow {} waiting on {} tasks in {}", id, report.pending.len(), from);
            return Ok(StageTransitionResult::NotReady {
                stage: from,
                pending: report.pending,
            });
        }

        let expected = wf.version;
        let now = Utc::now();
        let note = (!report.tolerated.is_empty()).then(|| format!("{} tolerated failures", report.tolerated.len()));

        let Some(to) = from.next() else {
            wf.exit_stage(StageOutcome::Completed, note, now);
            wf.status = WorkflowStatus::Completed;
            wf.touch(now);
            self.save(expected, &wf).await?;
            info!("Workflow {} completed", id);
            self.events.publish(EventKind::WorkflowCompleted { workflow_id: id });
            return Ok(StageTransitionResult::Completed);
        };

        if !from.allows(to, wf.failed_stage) {
            return Err(WorkflowError::InvalidStageTransition { workflow_id: id, from, to });
        }

        let deliverables = self.prior_deliverables(id, to).await?;
        let drafts = self.draft_tasks(self.plan_stage(&wf, to), &deliverables).await?;
        wf.exit_stage(StageOutcome::Advanced, note, now);
        wf.enter_stage(to, now);
        wf.touch(now);
        let bound = self.commit_drafts(expected, &wf, &drafts).await?;

        info!("Workflow {} advanced {} -> {} ({} tasks bound)", id, from, to, bound.len());
        self.events.publish(EventKind::WorkflowStageAdvanced { workflow_id: id, from, to });
        Ok(StageTransitionResult::Advanced { from, to, bound })
    }

    /// Send a running workflow to `error` immediately.
    ///
    /// A workflow already in `error` is returned unchanged.
    pub async fn force_error(&self, id: WorkflowId, reason: &str) -> Result<WorkflowExecution> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut wf = self.load(id).await?;
        if wf.status.is_terminal() || wf.status == WorkflowStatus::Draft {
            return Err(invalid_state(&wf, "enter error"));
        }
        if wf.current_stage == WorkflowStage::Error {
            debug!("Workflow {} already in error", id);
            return Ok(wf);
        }
        self.enter_error(&mut wf, reason, Utc::now()).await?;
        Ok(wf)
    }

    /// Leave `error` by re-entering the stage that failed.
    ///
    /// Terminally failed tasks are replaced by fresh ones, blocked tasks go
    /// back to `pending`. Past the retry budget the workflow fails for good
    /// and [`WorkflowError::RetryExhausted`] is returned.
    pub async fn retry_stage(&self, id: WorkflowId) -> Result<StageTransitionResult> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut wf = self.load(id).await?;
        if wf.status.is_terminal() {
            return Err(invalid_state(&wf, "retry a stage"));
        }
        let stage = match (wf.current_stage, wf.failed_stage) {
            (WorkflowStage::Error, Some(stage)) => stage,
            (current, _) => {
                return Err(WorkflowError::InvalidStageTransition {
                    workflow_id: id,
                    from: current,
                    to: current,
                })
            }
        };

        let expected = wf.version;
        let now = Utc::now();
        wf.retry_count += 1;

        if wf.retry_count > wf.max_retries {
            wf.status = WorkflowStatus::Failed;
            wf.exit_stage(StageOutcome::Failed, Some(format!("stage {} retries exhausted", stage)), now);
            wf.touch(now);
            self.save(expected, &wf).await?;
            warn!("Workflow {} failed: stage {} exhausted {} retries", id, stage, wf.max_retries);
            self.events.publish(EventKind::WorkflowFailed { workflow_id: id, stage });
            return Err(WorkflowError::RetryExhausted {
                workflow_id: id,
                stage,
                retries: wf.max_retries,
            });
        }

        let deliverables = self.prior_deliverables(id, stage).await?;
        let mut planned = Vec::new();
        let mut blocked = Vec::new();
        for binding in self.storage.list_bindings(id, Some(stage)).await? {
            let task = self.store.get(binding.task_id).await?;
            if task.terminally_failed() {
                let spec = self
                    .blueprint
                    .template(stage, binding.ordinal)
                    .map(|template| template_spec(&wf, template))
                    .unwrap_or_else(|| respawn_spec(&task));
                let slot = Slot {
                    workflow_id: id,
                    stage,
                    ordinal: binding.ordinal,
                    required: binding.required,
                    key_deliverable: binding.key_deliverable,
                    attempt: binding.attempt + 1,
                };
                debug!("Replacing task {} (attempt {})", task.id, slot.attempt);
                planned.push((spec, slot));
            } else if task.status == TaskStatus::Blocked {
                blocked.push(task.id);
            }
        }

        let drafts = self.draft_tasks(planned, &deliverables).await?;
        wf.failed_stage = None;
        wf.last_error = None;
        wf.exit_stage(StageOutcome::Retried, None, now);
        wf.enter_stage(stage, now);
        wf.touch(now);
        let replaced = self.commit_drafts(expected, &wf, &drafts).await?;

        let mut requeued = Vec::with_capacity(blocked.len());
        for task_id in blocked {
            self.scheduler.unblock(task_id, &ActorId::system()).await?;
            requeued.push(task_id);
        }

        info!(
            "Workflow {} retrying {} (retry {} of {}): {} replaced, {} requeued",
            id,
            stage,
            wf.retry_count,
            wf.max_retries,
            replaced.len(),
            requeued.len()
        );
        self.events.publish(EventKind::WorkflowStageAdvanced {
            workflow_id: id,
            from: WorkflowStage::Error,
            to: stage,
        });
        Ok(StageTransitionResult::Retried { stage, replaced, requeued })
    }

    /// Cancel the workflow and every non-terminal bound task.
    pub async fn cancel(&self, id: WorkflowId, actor: &ActorId) -> Result<WorkflowExecution> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut wf = self.load(id).await?;
        if wf.status.is_terminal() {
            return Err(invalid_state(&wf, "cancel"));
        }

        let mut cancelled = 0;
        for binding in self.storage.list_bindings(id, None).await? {
            let task = self.store.get(binding.task_id).await?;
            match task.status {
                status if status.is_terminal() => continue,
                TaskStatus::Failed => {
                    self.scheduler.abandon(task.id, "workflow cancelled").await?;
                }
                _ => {
                    self.scheduler.cancel_task(task.id, actor).await?;
                }
            }
            cancelled += 1;
        }

        let expected = wf.version;
        let now = Utc::now();
        wf.exit_stage(StageOutcome::Cancelled, None, now);
        wf.status = WorkflowStatus::Cancelled;
        wf.touch(now);
        self.save(expected, &wf).await?;

        info!("Workflow {} cancelled by {} ({} tasks stopped)", id, actor, cancelled);
        self.events.publish(EventKind::WorkflowCancelled { workflow_id: id });
        Ok(wf)
    }

    /// Force active workflows whose current stage overran its timeout into
    /// `error`. Returns the affected workflows.
    pub async fn check_timeouts(&self, now: Time) -> Result<Vec<WorkflowId>> {
        let mut timed_out = Vec::new();
        for wf in self.storage.list_workflows().await? {
            if wf.status != WorkflowStatus::Active || wf.current_stage == WorkflowStage::Error {
                continue;
            }
            let Some(limit) = self.timeout_for(wf.current_stage) else {
                continue;
            };
            let Some(entered_at) = wf.stage_entered_at() else {
                continue;
            };
            if now - entered_at <= Duration::seconds(i64::try_from(limit).unwrap_or(i64::MAX)) {
                continue;
            }

            let reason = format!("stage {} timed out after {}s", wf.current_stage, limit);
            warn!("Workflow {}: {}", wf.id, reason);
            self.force_error(wf.id, &reason).await?;
            timed_out.push(wf.id);
        }
        Ok(timed_out)
    }

    /// Re-check every active workflow whose current stage binds `task_id`.
    pub async fn on_task_terminal(&self, task_id: TaskId) -> Result<Vec<(WorkflowId, StageTransitionResult)>> {
        let mut results = Vec::new();
        for binding in self.storage.bindings_for_task(task_id).await? {
            let wf = self.load(binding.workflow_id).await?;
            if wf.status != WorkflowStatus::Active || wf.current_stage != binding.stage {
                continue;
            }
            results.push((wf.id, self.advance(wf.id).await?));
        }
        Ok(results)
    }

    /// Workflows bound to `task_id`.
    pub async fn workflows_for_task(&self, task_id: TaskId) -> Result<Vec<WorkflowId>> {
        let mut ids: Vec<WorkflowId> = self
            .storage
            .bindings_for_task(task_id)
            .await?
            .into_iter()
            .map(|b| b.workflow_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Load a workflow.
    pub async fn get(&self, id: WorkflowId) -> Result<WorkflowExecution> {
        self.load(id).await
    }

    /// All workflows, oldest first.
    pub async fn list(&self) -> Result<Vec<WorkflowExecution>> {
        Ok(self.storage.list_workflows().await?)
    }

    /// Bindings of a workflow, optionally for one stage.
    pub async fn bindings(&self, id: WorkflowId, stage: Option<WorkflowStage>) -> Result<Vec<StageBinding>> {
        Ok(self.storage.list_bindings(id, stage).await?)
    }

    async fn set_status(
        &self,
        id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
        operation: &'static str,
    ) -> Result<WorkflowExecution> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut wf = self.load(id).await?;
        require_status(&wf, from, operation)?;
        let expected = wf.version;
        wf.status = to;
        wf.touch(Utc::now());
        self.save(expected, &wf).await?;
        info!("Workflow {} {} -> {}", id, from, to);
        Ok(wf)
    }

    async fn enter_error(&self, wf: &mut WorkflowExecution, reason: &str, now: Time) -> Result<()> {
        let expected = wf.version;
        let stage = wf.current_stage;
        wf.failed_stage = Some(stage);
        wf.last_error = Some(reason.to_string());
        wf.exit_stage(StageOutcome::Errored, Some(reason.to_string()), now);
        wf.enter_stage(WorkflowStage::Error, now);
        wf.touch(now);
        self.save(expected, wf).await?;

        warn!("Workflow {} entered error at {}: {}", wf.id, stage, reason);
        self.events.publish(EventKind::WorkflowEnteredError {
            workflow_id: wf.id,
            stage,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn evaluate(&self, id: WorkflowId, stage: WorkflowStage) -> Result<StageReport> {
        let mut report = StageReport::default();
        for binding in self.storage.list_bindings(id, Some(stage)).await? {
            let task = self.store.get(binding.task_id).await?;
            if task.succeeded() {
                continue;
            }
            if task.terminally_failed() {
                if binding.required {
                    report.failed_required.push(task.id);
                } else {
                    report.tolerated.push(task.id);
                }
            } else {
                report.pending.push(task.id);
            }
        }
        Ok(report)
    }

    /// Successful key deliverables of the stage before `stage`.
    async fn prior_deliverables(&self, id: WorkflowId, stage: WorkflowStage) -> Result<Vec<TaskId>> {
        let prior = match stage.position() {
            Some(pos) if pos > 0 => WorkflowStage::SEQUENCE[pos - 1],
            _ => return Ok(Vec::new()),
        };

        let mut deliverables = Vec::new();
        for binding in self.storage.list_bindings(id, Some(prior)).await? {
            if !binding.key_deliverable {
                continue;
            }
            let task = self.store.get(binding.task_id).await?;
            // A deleted deliverable can take no new edges; its work is done.
            if task.succeeded() && !task.is_deleted() {
                deliverables.push(task.id);
            }
        }
        Ok(deliverables)
    }

    /// Specs and slots for every task `stage` binds.
    fn plan_stage(&self, wf: &WorkflowExecution, stage: WorkflowStage) -> Vec<(TaskSpec, Slot)> {
        let Some(policy) = self.blueprint.policy(stage) else {
            return Vec::new();
        };
        policy
            .tasks
            .iter()
            .enumerate()
            .map(|(ordinal, template)| {
                let slot = Slot {
                    workflow_id: wf.id,
                    stage,
                    ordinal: ordinal as u32,
                    required: template.required,
                    key_deliverable: template.key_deliverable,
                    attempt: 0,
                };
                (template_spec(wf, template), slot)
            })
            .collect()
    }

    /// Create `planned` tasks as drafts with hard edges to `deliverables`.
    ///
    /// Drafts are never scheduled. If anything fails part-way, the drafts
    /// created so far are discarded before the error is returned.
    async fn draft_tasks(&self, planned: Vec<(TaskSpec, Slot)>, deliverables: &[TaskId]) -> Result<Vec<(TaskId, Slot)>> {
        let mut drafts = Vec::with_capacity(planned.len());
        if let Err(e) = self.wire_drafts(planned, deliverables, &mut drafts).await {
            self.discard(&drafts).await;
            return Err(e);
        }
        Ok(drafts)
    }

    async fn wire_drafts(
        &self,
        planned: Vec<(TaskSpec, Slot)>,
        deliverables: &[TaskId],
        drafts: &mut Vec<(TaskId, Slot)>,
    ) -> Result<()> {
        for (spec, slot) in planned {
            let task_id = self.store.create(spec.as_draft()).await?;
            drafts.push((task_id, slot));
            for &target in deliverables {
                self.graph.add_dependency(task_id, target, DependencyKind::Hard).await?;
            }
        }
        Ok(())
    }

    /// Save `wf`, bind the drafts, then release them to `pending`.
    async fn commit_drafts(&self, expected: u64, wf: &WorkflowExecution, drafts: &[(TaskId, Slot)]) -> Result<Vec<TaskId>> {
        if let Err(e) = self.persist(expected, wf, drafts).await {
            self.discard(drafts).await;
            return Err(e);
        }

        let actor = ActorId::system();
        let mut released = Vec::with_capacity(drafts.len());
        for &(task_id, _) in drafts {
            self.store.update_status(task_id, TaskStatus::Pending, &actor).await?;
            released.push(task_id);
        }
        Ok(released)
    }

    async fn persist(&self, expected: u64, wf: &WorkflowExecution, drafts: &[(TaskId, Slot)]) -> Result<()> {
        self.save(expected, wf).await?;
        for &(task_id, slot) in drafts {
            self.storage.save_binding(&slot.bind(task_id)).await?;
        }
        Ok(())
    }

    /// Tombstone drafts that never made it into a binding.
    async fn discard(&self, drafts: &[(TaskId, Slot)]) {
        for &(task_id, _) in drafts {
            if let Err(e) = self.graph.remove_task(task_id).await {
                warn!("Dropping edges of draft {} failed: {}", task_id, e);
            }
            if let Err(e) = self.store.soft_delete(task_id).await {
                warn!("Discarding draft {} failed: {}", task_id, e);
            }
        }
        if !drafts.is_empty() {
            warn!("Discarded {} unbound draft tasks", drafts.len());
        }
    }

    fn timeout_for(&self, stage: WorkflowStage) -> Option<u64> {
        self.config
            .timeout_override(stage)
            .or_else(|| self.blueprint.policy(stage).and_then(|p| p.timeout_secs))
    }

    async fn lock_for(&self, id: WorkflowId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(&id).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(id, Arc::downgrade(&lock));
        lock
    }

    async fn load(&self, id: WorkflowId) -> Result<WorkflowExecution> {
        self.storage.load_workflow(id).await?.ok_or(WorkflowError::NotFound(id))
    }

    async fn save(&self, expected: u64, wf: &WorkflowExecution) -> Result<()> {
        if self.storage.compare_and_set_workflow(expected, wf).await? {
            Ok(())
        } else {
            Err(OrchestrationError::Conflict(format!("workflow {}", wf.id)).into())
        }
    }
}

fn require_status(wf: &WorkflowExecution, status: WorkflowStatus, operation: &'static str) -> Result<()> {
    if wf.status == status {
        Ok(())
    } else {
        Err(invalid_state(wf, operation))
    }
}

fn invalid_state(wf: &WorkflowExecution, operation: &'static str) -> WorkflowError {
    WorkflowError::InvalidState {
        workflow_id: wf.id,
        status: wf.status,
        operation,
    }
}

/// A task built from a blueprint template for `wf`.
fn template_spec(wf: &WorkflowExecution, template: &TaskTemplate) -> TaskSpec {
    let mut spec = TaskSpec::new(wf.organization_id.clone(), template.name.clone())
        .with_description(template.description.clone())
        .with_priority(template.priority)
        .created_by(wf.created_by.clone());
    if let Some(max_retries) = template.max_retries {
        spec = spec.with_max_retries(max_retries);
    }
    if let Some(operation) = &template.operation {
        spec = spec.with_operation(operation.clone());
    }
    spec
}

/// A fresh task carrying the failed task's definition, for slots the
/// blueprint no longer describes.
fn respawn_spec(task: &Task) -> TaskSpec {
    let mut spec = TaskSpec::new(task.organization_id.clone(), task.name.clone())
        .with_description(task.description.clone())
        .with_priority(task.priority)
        .with_max_retries(task.max_retries)
        .created_by(task.created_by.clone());
    if let Some(operation) = &task.operation {
        spec = spec.with_operation(operation.clone());
    }
    spec
}
