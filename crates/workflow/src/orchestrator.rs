//! Wires the task layer, stage engine, and integration adapter together.

use std::collections::HashMap;
use std::sync::Arc;

use devflow_core::{ActorId, Event, EventKind, TaskId, TaskStatus};
use devflow_execution::{DependencyGraph, EventBus, TaskScheduler, TaskStore};
use devflow_storage::Storage;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{IntegrationAdapter, OperationHandle, OperationResult};
use crate::config::OrchestratorConfig;
use crate::engine::WorkflowEngine;
use crate::error::{Result, WorkflowError};
use crate::stage::Blueprint;

/// A task handed to a worker by [`Orchestrator::dispatch_ready`].
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    /// Started task
    pub task_id: TaskId,
    /// Adapter handle, for tasks bound to an operation
    pub handle: Option<OperationHandle>,
}

/// The assembled orchestration core.
pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    events: EventBus,
    store: Arc<TaskStore>,
    graph: Arc<DependencyGraph>,
    scheduler: Arc<TaskScheduler>,
    engine: Arc<WorkflowEngine>,
    adapter: Arc<dyn IntegrationAdapter>,
    auto_advance: bool,
    operations: Mutex<HashMap<OperationHandle, TaskId>>,
}

impl Orchestrator {
    /// Build every component over `storage`.
    pub fn new(
        storage: Arc<dyn Storage>,
        adapter: Arc<dyn IntegrationAdapter>,
        config: &OrchestratorConfig,
        blueprint: Blueprint,
    ) -> Self {
        let events = EventBus::new();
        let store = Arc::new(
            TaskStore::new(storage.clone(), events.clone())
                .with_default_max_retries(config.scheduler.default_max_retries),
        );
        let graph = Arc::new(DependencyGraph::with_config(
            storage.clone(),
            events.clone(),
            config.graph.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            store.clone(),
            graph.clone(),
            events.clone(),
            config.scheduler.clone(),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            storage.clone(),
            store.clone(),
            graph.clone(),
            scheduler.clone(),
            events.clone(),
            blueprint,
            config.workflow.clone(),
        ));

        Self {
            storage,
            events,
            store,
            graph,
            scheduler,
            engine,
            adapter,
            auto_advance: config.workflow.auto_advance,
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Backing storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Task store.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Dependency graph.
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    /// Task scheduler.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Workflow engine.
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Subscribe to everything the core publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Claim and start up to `limit` ready tasks for `worker`, invoking the
    /// adapter for those bound to an operation.
    ///
    /// A retryable invoke error counts as a task failure. Any other invoke
    /// error abandons the task and forces its workflows into `error`.
    pub async fn dispatch_ready(&self, worker: &ActorId, limit: usize) -> Result<Vec<Dispatched>> {
        let mut dispatched = Vec::new();

        for claimed in self.scheduler.claim_next_batch(limit, worker).await? {
            let task = self.scheduler.start(claimed.id, worker).await?;
            let Some(operation) = task.operation.clone() else {
                dispatched.push(Dispatched { task_id: task.id, handle: None });
                continue;
            };

            let payload = serde_json::json!({
                "task_id": task.id.to_string(),
                "organization_id": task.organization_id.as_str(),
                "name": task.name,
                "description": task.description,
                "attempt": task.retry_count + 1,
            });

            match self.adapter.invoke(&operation, payload).await {
                Ok(handle) => {
                    info!("Task {} dispatched to {} as {}", task.id, operation, handle);
                    self.operations.lock().await.insert(handle.clone(), task.id);
                    dispatched.push(Dispatched { task_id: task.id, handle: Some(handle) });
                }
                Err(e) if e.is_retryable() => {
                    warn!("Invoking {} for task {} failed: {}", operation, task.id, e);
                    self.scheduler.on_task_failed(task.id, &e.to_string()).await?;
                }
                Err(e) => {
                    error!("Invoking {} for task {} failed permanently: {}", operation, task.id, e);
                    let reason = format!("{} failed for task {}: {}", operation, task.id, e);
                    self.scheduler.abandon(task.id, &e.to_string()).await?;
                    for workflow_id in self.engine.workflows_for_task(task.id).await? {
                        match self.engine.force_error(workflow_id, &reason).await {
                            Ok(_) => {}
                            Err(WorkflowError::InvalidState { .. }) => {
                                debug!("Workflow {} not running, leaving it", workflow_id)
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }
        Ok(dispatched)
    }

    /// Route an adapter result to its task.
    ///
    /// Unknown or already-handled handles are ignored and yield `None`.
    pub async fn on_operation_result(
        &self,
        handle: &OperationHandle,
        result: OperationResult,
    ) -> Result<Option<TaskId>> {
        let Some(task_id) = self.operations.lock().await.remove(handle) else {
            warn!("Result for unknown operation {}", handle);
            return Ok(None);
        };

        match result {
            OperationResult::Succeeded { .. } => {
                self.scheduler.on_task_completed(task_id, &ActorId::new("adapter")).await?;
            }
            OperationResult::Failed { message } => {
                self.scheduler.on_task_failed(task_id, &message).await?;
            }
        }
        Ok(Some(task_id))
    }

    /// React to one event. Safe to call more than once per event.
    pub async fn handle_event(&self, event: &Event) -> Result<()> {
        debug!("Handling {}", event.kind.name());
        match &event.kind {
            EventKind::TaskCompleted { task_id } => {
                self.graph.on_task_completed(*task_id).await?;
                self.auto_advance(*task_id).await?;
            }
            EventKind::TaskFailed {
                task_id,
                exhausted: true,
                ..
            } => self.auto_advance(*task_id).await?,
            EventKind::TaskStatusChanged {
                task_id,
                to: TaskStatus::Cancelled,
                ..
            } => self.auto_advance(*task_id).await?,
            EventKind::DependencySatisfied { source_id, .. } => {
                self.scheduler.reevaluate(*source_id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Handle every event currently queued on `rx`, including any produced
    /// while handling. Returns how many were handled.
    pub async fn pump(&self, rx: &mut broadcast::Receiver<Event>) -> Result<usize> {
        let mut handled = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    self.handle_event(&event).await?;
                    handled += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => warn!("Event pump lagged, skipped {} events", skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Ok(handled)
    }

    /// Run [`handle_event`](Self::handle_event) for every event in a
    /// background task. Errors are logged, not propagated; stale events that
    /// no longer fit the current state only log at debug.
    pub fn spawn_listener(self: Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match self.handle_event(&event).await {
                        Ok(()) => {}
                        Err(e) if e.is_caller_error() => {
                            debug!("Skipped stale {}: {}", event.kind.name(), e);
                        }
                        Err(e) => warn!("Handling {} failed: {}", event.kind.name(), e),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!("Listener lagged, skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn auto_advance(&self, task_id: TaskId) -> Result<()> {
        if !self.auto_advance {
            return Ok(());
        }
        match self.engine.on_task_terminal(task_id).await {
            Ok(results) => {
                for (workflow_id, result) in results {
                    debug!("Auto-advance of {}: {:?}", workflow_id, result);
                }
                Ok(())
            }
            Err(WorkflowError::InvalidState { workflow_id, .. }) => {
                debug!("Workflow {} changed state, skipping auto-advance", workflow_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
