//! devflow CLI - operate the task graph and workflow stages by hand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use devflow_core::{
    ActorId, DependencyKind, Event, OrganizationId, Priority, Task, TaskFilter, TaskId, TaskSpec,
    TaskStatus, WorkflowExecution, WorkflowId,
};
use devflow_storage::JsonStorage;
use devflow_workflow::{
    Blueprint, Orchestrator, OrchestratorConfig, RecordingAdapter, StageTransitionResult,
};
use tokio::sync::broadcast;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devflow")]
#[command(about = "Task dependency graph and workflow stage orchestration", long_about = None)]
struct Cli {
    /// Storage directory
    #[arg(long, global = true, default_value = ".devflow")]
    storage: PathBuf,

    /// Configuration file
    #[arg(long, global = true, default_value = "devflow.toml")]
    config: PathBuf,

    /// Identity recorded on changes
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// Manage dependency edges
    #[command(subcommand)]
    Dep(DepCommand),
    /// List tasks ready to run
    Ready {
        /// Maximum tasks to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Claim ready tasks for the current actor
    Claim {
        /// Maximum tasks to claim
        #[arg(long, default_value = "1")]
        limit: usize,
    },
    /// Start a claimed task
    Start {
        /// Task ID
        id: TaskId,
    },
    /// Complete a task
    Complete {
        /// Task ID
        id: TaskId,
    },
    /// Record a task failure
    Fail {
        /// Task ID
        id: TaskId,
        /// Error message
        #[arg(long)]
        error: String,
    },
    /// Drive workflows
    #[command(subcommand)]
    Workflow(WorkflowCommand),
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Add a new task
    Add(AddTask),
    /// Show task details
    Show {
        /// Task ID
        id: TaskId,
    },
    /// List tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Filter by organization
        #[arg(long)]
        org: Option<String>,
    },
    /// Apply a status transition
    Status {
        /// Task ID
        id: TaskId,
        /// New status
        status: TaskStatus,
    },
    /// Tombstone a draft or finished task
    Delete {
        /// Task ID
        id: TaskId,
    },
}

#[derive(Args)]
struct AddTask {
    /// Task name
    name: String,
    /// Organization
    #[arg(long, default_value = "default")]
    org: String,
    /// Description
    #[arg(long, default_value = "")]
    description: String,
    /// Parent task
    #[arg(long)]
    parent: Option<TaskId>,
    /// Priority
    #[arg(long, default_value = "normal")]
    priority: Priority,
    /// Retry budget
    #[arg(long)]
    max_retries: Option<u32>,
    /// Integration operation to invoke on dispatch
    #[arg(long)]
    operation: Option<String>,
    /// Create in draft instead of pending
    #[arg(long)]
    draft: bool,
}

#[derive(Subcommand)]
enum DepCommand {
    /// SOURCE depends on TARGET
    Add {
        /// Dependent task
        source: TaskId,
        /// Prerequisite task
        target: TaskId,
        /// Dependency kind
        #[arg(long, default_value = "hard")]
        kind: DependencyKind,
    },
    /// Remove an edge
    Remove {
        /// Dependent task
        source: TaskId,
        /// Prerequisite task
        target: TaskId,
        /// Dependency kind
        #[arg(long, default_value = "hard")]
        kind: DependencyKind,
    },
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// Register a workflow in draft
    Create {
        /// Workflow name
        name: String,
        /// Organization
        #[arg(long, default_value = "default")]
        org: String,
    },
    /// Start a draft workflow
    Start {
        /// Workflow ID
        id: WorkflowId,
    },
    /// Advance to the next stage if possible
    Advance {
        /// Workflow ID
        id: WorkflowId,
    },
    /// Force the workflow into error
    Error {
        /// Workflow ID
        id: WorkflowId,
        /// Reason
        #[arg(long)]
        reason: String,
    },
    /// Retry the failed stage
    Retry {
        /// Workflow ID
        id: WorkflowId,
    },
    /// Cancel the workflow and its tasks
    Cancel {
        /// Workflow ID
        id: WorkflowId,
    },
    /// Show workflow details
    Show {
        /// Workflow ID
        id: WorkflowId,
    },
    /// List workflows
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = OrchestratorConfig::load(&cli.config)?;
    init_tracing(&config.logging.level)?;

    let storage = Arc::new(JsonStorage::new(&cli.storage).await?);
    let orch = Orchestrator::new(storage, Arc::new(RecordingAdapter::new()), &config, Blueprint::standard());
    let actor = ActorId::new(cli.actor.clone());

    // Events raised by this command are handled before exit.
    let mut rx = orch.subscribe();

    match cli.command {
        Commands::Task(cmd) => task_command(&orch, &actor, cmd).await?,
        Commands::Dep(cmd) => dep_command(&orch, cmd).await?,
        Commands::Ready { limit } => {
            let ready = orch.scheduler().next_ready_batch(limit).await?;
            println!("Ready ({})", ready.len());
            for id in ready {
                print_task_line(&orch.store().get(id).await?);
            }
        }
        Commands::Claim { limit } => {
            let claimed = orch.scheduler().claim_next_batch(limit, &actor).await?;
            if claimed.is_empty() {
                println!("Nothing to claim");
            }
            for task in claimed {
                println!("Claimed {} - {}", task.id, task.name);
            }
        }
        Commands::Start { id } => {
            let task = orch.scheduler().start(id, &actor).await?;
            println!("Started {} - {}", task.id, task.name);
        }
        Commands::Complete { id } => {
            let unblocked = orch.scheduler().on_task_completed(id, &actor).await?;
            println!("Completed {}", id);
            for source in unblocked {
                println!("  satisfied dependency of {}", source);
            }
        }
        Commands::Fail { id, error } => {
            let outcome = orch.scheduler().on_task_failed(id, &error).await?;
            println!("Recorded failure of {}: {:?}", id, outcome);
        }
        Commands::Workflow(cmd) => workflow_command(&orch, &actor, cmd).await?,
    }

    drain(&orch, &mut rx).await
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(level).map_err(|e| anyhow!("invalid log level '{}': {}", level, e))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn drain(orch: &Orchestrator, rx: &mut broadcast::Receiver<Event>) -> Result<()> {
    let handled = orch.pump(rx).await?;
    debug!("Handled {} events", handled);
    Ok(())
}

async fn task_command(orch: &Orchestrator, actor: &ActorId, cmd: TaskCommand) -> Result<()> {
    match cmd {
        TaskCommand::Add(add) => {
            let mut spec = TaskSpec::new(OrganizationId::new(add.org), add.name)
                .with_description(add.description)
                .with_priority(add.priority)
                .created_by(actor.clone());
            if let Some(parent) = add.parent {
                spec = spec.with_parent(parent);
            }
            if let Some(max_retries) = add.max_retries {
                spec = spec.with_max_retries(max_retries);
            }
            if let Some(operation) = add.operation {
                spec = spec.with_operation(operation);
            }
            if add.draft {
                spec = spec.as_draft();
            }
            let task = orch.store().create_task(spec).await?;
            println!("Added task: {} - {}", task.id, task.name);
        }
        TaskCommand::Show { id } => {
            let task = orch.store().get(id).await?;
            print_task(&task);
            let deps = orch.graph().dependencies_of(id).await?;
            if !deps.is_empty() {
                println!("  Depends on:");
                for edge in deps {
                    let mark = if edge.is_satisfied { "x" } else { " " };
                    println!("    [{}] {} ({})", mark, edge.target_id, edge.kind);
                }
            }
            let dependents = orch.graph().dependents_of(id).await?;
            if !dependents.is_empty() {
                println!("  Required by:");
                for edge in dependents {
                    println!("    {} ({})", edge.source_id, edge.kind);
                }
            }
        }
        TaskCommand::List { status, org } => {
            let filter = TaskFilter {
                organization_id: org.map(OrganizationId::new),
                status: status.map(|s| vec![s]),
                ..Default::default()
            };
            let tasks = orch.store().list(&filter).await?;
            println!("Tasks ({})", tasks.len());
            for task in tasks {
                print_task_line(&task);
            }
        }
        TaskCommand::Status { id, status } => {
            let task = match status {
                TaskStatus::Completed => {
                    orch.scheduler().on_task_completed(id, actor).await?;
                    orch.store().get(id).await?
                }
                TaskStatus::Cancelled => orch.scheduler().cancel_task(id, actor).await?.task,
                other => orch.store().update_status(id, other, actor).await?,
            };
            println!("{} is now {}", task.id, task.status);
        }
        TaskCommand::Delete { id } => {
            orch.store().soft_delete(id).await?;
            let removed = orch.graph().remove_task(id).await?;
            println!("Deleted {} ({} edges removed)", id, removed.len());
        }
    }
    Ok(())
}

async fn dep_command(orch: &Orchestrator, cmd: DepCommand) -> Result<()> {
    match cmd {
        DepCommand::Add { source, target, kind } => {
            let edge = orch.graph().add_dependency(source, target, kind).await?;
            let state = if edge.is_satisfied { "satisfied" } else { "unsatisfied" };
            println!("{} now depends on {} ({}, {})", source, target, kind, state);
        }
        DepCommand::Remove { source, target, kind } => {
            if orch.graph().remove_dependency(source, target, kind).await? {
                println!("Removed {} -> {} ({})", source, target, kind);
            } else {
                println!("No such dependency");
            }
        }
    }
    Ok(())
}

async fn workflow_command(orch: &Orchestrator, actor: &ActorId, cmd: WorkflowCommand) -> Result<()> {
    let engine = orch.engine();
    match cmd {
        WorkflowCommand::Create { name, org } => {
            let wf = engine.create_workflow(OrganizationId::new(org), &name, actor).await?;
            println!("Created workflow: {} - {}", wf.id, wf.name);
        }
        WorkflowCommand::Start { id } => {
            let wf = engine.start(id).await?;
            println!("Started {} at {}", wf.id, wf.current_stage);
        }
        WorkflowCommand::Advance { id } => print_transition(engine.advance(id).await?),
        WorkflowCommand::Error { id, reason } => {
            let wf = engine.force_error(id, &reason).await?;
            println!("{} is in error (failed stage: {:?})", wf.id, wf.failed_stage);
        }
        WorkflowCommand::Retry { id } => print_transition(engine.retry_stage(id).await?),
        WorkflowCommand::Cancel { id } => {
            let wf = engine.cancel(id, actor).await?;
            println!("Cancelled {}", wf.id);
        }
        WorkflowCommand::Show { id } => {
            let wf = engine.get(id).await?;
            print_workflow(&wf);
            for binding in engine.bindings(id, None).await? {
                let task = orch.store().get(binding.task_id).await?;
                let flags = match (binding.required, binding.key_deliverable) {
                    (true, true) => "required, key",
                    (true, false) => "required",
                    (false, true) => "key",
                    (false, false) => "tolerated",
                };
                println!(
                    "    {:<28} #{} {} {} [{}] attempt {}",
                    binding.stage.as_str(),
                    binding.ordinal,
                    task.id,
                    task.status,
                    flags,
                    binding.attempt
                );
            }
        }
        WorkflowCommand::List => {
            let workflows = engine.list().await?;
            println!("Workflows ({})", workflows.len());
            for wf in workflows {
                println!("  {} | {} | {} - {}", wf.id, wf.status, wf.current_stage, wf.name);
            }
        }
    }
    Ok(())
}

fn print_transition(result: StageTransitionResult) {
    match result {
        StageTransitionResult::Advanced { from, to, bound } => {
            println!("Advanced {} -> {} ({} tasks bound)", from, to, bound.len());
        }
        StageTransitionResult::NotReady { stage, pending } => {
            println!("Still in {}: waiting on {} tasks", stage, pending.len());
            for id in pending {
                println!("  {}", id);
            }
        }
        StageTransitionResult::EnteredError { stage, reason, .. } => {
            println!("Stage {} failed: {}", stage, reason);
        }
        StageTransitionResult::Completed => println!("Workflow completed"),
        StageTransitionResult::Retried { stage, replaced, requeued } => {
            println!(
                "Retrying {}: {} tasks replaced, {} requeued",
                stage,
                replaced.len(),
                requeued.len()
            );
        }
    }
}

fn print_task_line(task: &Task) {
    println!(
        "  {} | {:<11} | {:<8} | {}",
        task.id,
        task.status.as_str(),
        task.priority.as_str(),
        task.name
    );
}

fn print_task(task: &Task) {
    println!("Task: {}", task.id);
    println!("  Name: {}", task.name);
    if !task.description.is_empty() {
        println!("  Description: {}", task.description);
    }
    println!("  Organization: {}", task.organization_id.as_str());
    println!("  Status: {}", task.status);
    if let Some(reason) = &task.block_reason {
        println!("  Blocked: {:?}", reason);
    }
    println!("  Priority: {}", task.priority.as_str());
    println!("  Level: {} (root {})", task.level, task.root_id);
    println!("  Retries: {}/{}", task.retry_count, task.max_retries);
    if let Some(error) = &task.last_error {
        println!("  Last error: {}", error);
    }
    if let Some(worker) = &task.assigned_to {
        println!("  Assigned to: {}", worker);
    }
    println!("  Scheduled: {}", task.scheduled_at);
    println!("  Created: {}", task.created_at);
}

fn print_workflow(wf: &WorkflowExecution) {
    println!("Workflow: {}", wf.id);
    println!("  Name: {}", wf.name);
    println!("  Status: {}", wf.status);
    println!("  Stage: {}", wf.current_stage);
    if let Some(stage) = wf.failed_stage {
        println!("  Failed stage: {}", stage);
    }
    if let Some(error) = &wf.last_error {
        println!("  Last error: {}", error);
    }
    println!("  Retries: {}/{}", wf.retry_count, wf.max_retries);
    println!("  History:");
    for record in &wf.stage_history {
        let outcome = record.outcome.map(|o| format!("{:?}", o)).unwrap_or_else(|| "current".into());
        println!("    {:<28} {} {}", record.stage.as_str(), record.entered_at, outcome);
    }
    println!("  Tasks:");
}
