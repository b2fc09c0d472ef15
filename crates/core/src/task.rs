//! Task model - the unit of work the orchestrator schedules.

use serde::{Deserialize, Serialize};
use crate::id::{ActorId, OrganizationId, TaskId};
use crate::{ParseEnumError, Time};

/// A task represents a unit of work that can be scheduled and executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Tenant partition key
    pub organization_id: OrganizationId,

    /// Task name (never empty)
    pub name: String,

    /// Detailed description
    pub description: String,

    /// Parent task, if this is a subtask
    pub parent_id: Option<TaskId>,

    /// Topmost ancestor (self when there is no parent)
    pub root_id: TaskId,

    /// Distance from the root (0 for roots)
    pub level: u32,

    /// Current status
    pub status: TaskStatus,

    /// Scheduling priority
    pub priority: Priority,

    /// Number of times this task has entered `failed`
    pub retry_count: u32,

    /// Retry budget
    pub max_retries: u32,

    /// Last recorded execution error
    pub last_error: Option<String>,

    /// Earliest time the task may be handed out
    pub scheduled_at: Time,

    /// When execution last started
    pub started_at: Option<Time>,

    /// When the task completed
    pub completed_at: Option<Time>,

    /// Who created the task
    pub created_by: ActorId,

    /// Who currently holds the task
    pub assigned_to: Option<ActorId>,

    /// Why the task is blocked, while it is
    pub block_reason: Option<BlockReason>,

    /// Integration operation to invoke when the task is dispatched
    pub operation: Option<String>,

    /// Tombstone; tasks are never hard-deleted
    pub deleted_at: Option<Time>,

    /// Optimistic concurrency revision, bumped on every write
    pub version: u64,

    /// Creation timestamp
    pub created_at: Time,

    /// Last update timestamp
    pub updated_at: Time,
}

impl Task {
    /// Build a task from a spec.
    ///
    /// Hierarchy fields are derived from `parent`, which the caller must have
    /// loaded for `spec.parent_id`.
    pub fn from_spec(spec: TaskSpec, parent: Option<&Task>, default_max_retries: u32, now: Time) -> Self {
        let id = TaskId::new();
        let (root_id, level) = match parent {
            Some(p) => (p.root_id, p.level + 1),
            None => (id, 0),
        };

        Self {
            id,
            organization_id: spec.organization_id,
            name: spec.name,
            description: spec.description,
            parent_id: parent.map(|p| p.id),
            root_id,
            level,
            status: spec.initial_status,
            priority: spec.priority,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            last_error: None,
            scheduled_at: spec.scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            created_by: spec.created_by,
            assigned_to: None,
            block_reason: None,
            operation: spec.operation,
            deleted_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change together with the bookkeeping that follows from it.
    ///
    /// This is the only place the transition table is enforced. On error the
    /// task is left untouched.
    pub fn transition(
        &mut self,
        next: TaskStatus,
        actor: &ActorId,
        now: Time,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition { from: self.status, to: next });
        }

        if self.status == TaskStatus::Blocked {
            self.block_reason = None;
        }

        match next {
            TaskStatus::Pending => self.assigned_to = None,
            TaskStatus::Assigned => self.assigned_to = Some(actor.clone()),
            TaskStatus::InProgress => self.started_at = Some(now),
            TaskStatus::Completed => self.completed_at = Some(now),
            TaskStatus::Failed => self.retry_count += 1,
            _ => {}
        }

        self.status = next;
        self.touch(now);
        Ok(())
    }

    /// Bump the revision and update timestamp.
    pub fn touch(&mut self, now: Time) {
        self.version += 1;
        self.updated_at = now;
    }

    /// Whether the task carries a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Completed, or archived after completing.
    pub fn succeeded(&self) -> bool {
        match self.status {
            TaskStatus::Completed => true,
            TaskStatus::Archived => self.completed_at.is_some(),
            _ => false,
        }
    }

    /// Terminally failed: archived without success, or cancelled.
    pub fn terminally_failed(&self) -> bool {
        match self.status {
            TaskStatus::Cancelled => true,
            TaskStatus::Archived => self.completed_at.is_none(),
            TaskStatus::Failed => self.retries_exhausted(),
            _ => false,
        }
    }

    /// The retry budget has been used up.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }
}

/// Why a task sits in `blocked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockReason {
    /// Waiting on hard dependencies; clears automatically once they are satisfied
    Dependencies,
    /// A hard prerequisite was cancelled; needs an operator to unblock
    PrerequisiteCancelled {
        /// The cancelled prerequisite
        task_id: TaskId,
    },
    /// A hard prerequisite failed for good; needs an operator to unblock
    PrerequisiteFailed {
        /// The failed prerequisite
        task_id: TaskId,
    },
    /// Blocked by hand
    Manual {
        /// Free-form reason
        reason: String,
    },
}

impl BlockReason {
    /// Whether the scheduler may lift the block on its own.
    pub fn clears_automatically(&self) -> bool {
        matches!(self, BlockReason::Dependencies)
    }
}

/// A status change rejected by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transition {from} -> {to} is not allowed")]
pub struct InvalidTransition {
    /// Status before the attempted change
    pub from: TaskStatus,
    /// Requested status
    pub to: TaskStatus,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Being written, not yet queued
    Draft,
    /// Queued; eligible once hard dependencies are satisfied
    Pending,
    /// Claimed by a worker
    Assigned,
    /// Executing
    InProgress,
    /// Waiting on an external condition
    Blocked,
    /// Awaiting review
    Review,
    /// Finished successfully
    Completed,
    /// Execution failed
    Failed,
    /// Cancelled
    Cancelled,
    /// Retired
    Archived,
}

impl TaskStatus {
    /// Every status, in declaration order.
    pub const ALL: [TaskStatus; 10] = [
        TaskStatus::Draft,
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Review,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Archived,
    ];

    /// Statuses reachable in one step.
    pub fn allowed_transitions(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Draft => &[Pending, Cancelled],
            Pending => &[Assigned, Blocked, Cancelled],
            Assigned => &[InProgress, Pending, Cancelled],
            InProgress => &[Review, Blocked, Failed, Cancelled],
            Blocked => &[Pending, Assigned, Cancelled],
            Review => &[Completed, InProgress, Failed],
            Failed => &[Pending, Archived],
            Completed => &[Archived],
            Cancelled => &[Archived],
            Archived => &[],
        }
    }

    /// Check a single transition against the table.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// No further automatic transition happens from here.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Archived | TaskStatus::Cancelled)
    }

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| ParseEnumError::new("task status", s))
    }
}

/// Scheduling priority. Ordering follows declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Low
    Low,
    /// Normal
    #[default]
    Normal,
    /// High
    High,
    /// Urgent
    Urgent,
    /// Critical
    Critical,
}

impl Priority {
    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            "critical" => Ok(Priority::Critical),
            _ => Err(ParseEnumError::new("priority", s)),
        }
    }
}

/// Specification for creating a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Tenant partition key
    pub organization_id: OrganizationId,
    /// Task name
    pub name: String,
    /// Description
    pub description: String,
    /// Parent task
    pub parent_id: Option<TaskId>,
    /// Priority
    pub priority: Priority,
    /// Retry budget; the scheduler default applies when unset
    pub max_retries: Option<u32>,
    /// `Draft` or `Pending`
    pub initial_status: TaskStatus,
    /// Creator
    pub created_by: ActorId,
    /// Earliest dispatch time; defaults to creation time
    pub scheduled_at: Option<Time>,
    /// Integration operation to invoke on dispatch
    pub operation: Option<String>,
}

impl TaskSpec {
    /// A pending, normal-priority root task created by the system actor.
    pub fn new(organization_id: OrganizationId, name: impl Into<String>) -> Self {
        Self {
            organization_id,
            name: name.into(),
            description: String::new(),
            parent_id: None,
            priority: Priority::Normal,
            max_retries: None,
            initial_status: TaskStatus::Pending,
            created_by: ActorId::system(),
            scheduled_at: None,
            operation: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Make this a subtask of `parent_id`.
    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Create in `draft` instead of `pending`.
    pub fn as_draft(mut self) -> Self {
        self.initial_status = TaskStatus::Draft;
        self
    }

    /// Set the creator.
    pub fn created_by(mut self, actor: ActorId) -> Self {
        self.created_by = actor;
        self
    }

    /// Delay the first dispatch.
    pub fn scheduled_at(mut self, at: Time) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Bind an integration operation.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// Filter for querying tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Filter by tenant
    pub organization_id: Option<OrganizationId>,

    /// Filter by status
    pub status: Option<Vec<TaskStatus>>,

    /// Filter by parent
    pub parent_id: Option<TaskId>,

    /// Include tombstoned tasks
    pub include_deleted: bool,
}

impl TaskFilter {
    /// Tasks in a single status.
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(vec![status]),
            ..Default::default()
        }
    }

    /// Check a task against the filter.
    pub fn matches(&self, task: &Task) -> bool {
        if !self.include_deleted && task.is_deleted() {
            return false;
        }
        if let Some(org) = &self.organization_id {
            if &task.organization_id != org {
                return false;
            }
        }
        if let Some(statuses) = &self.status {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(parent) = self.parent_id {
            if task.parent_id != Some(parent) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_task(status: TaskStatus) -> Task {
        let spec = TaskSpec::new(OrganizationId::new("acme"), "build");
        let mut task = Task::from_spec(spec, None, 3, Utc::now());
        task.status = status;
        task
    }

    fn expected_table() -> Vec<(TaskStatus, TaskStatus)> {
        use TaskStatus::*;
        vec![
            (Draft, Pending), (Draft, Cancelled),
            (Pending, Assigned), (Pending, Blocked), (Pending, Cancelled),
            (Assigned, InProgress), (Assigned, Pending), (Assigned, Cancelled),
            (InProgress, Review), (InProgress, Blocked), (InProgress, Failed), (InProgress, Cancelled),
            (Blocked, Pending), (Blocked, Assigned), (Blocked, Cancelled),
            (Review, Completed), (Review, InProgress), (Review, Failed),
            (Failed, Pending), (Failed, Archived),
            (Completed, Archived),
            (Cancelled, Archived),
        ]
    }

    #[test]
    fn test_transition_matrix_matches_table() {
        let allowed = expected_table();
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                let mut task = make_task(from);
                let before = task.clone();
                let result = task.transition(to, &ActorId::system(), Utc::now());
                if allowed.contains(&(from, to)) {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                    assert_eq!(task.status, to);
                    assert_eq!(task.version, before.version + 1);
                } else {
                    assert_eq!(result, Err(InvalidTransition { from, to }));
                    assert_eq!(task, before, "{from} -> {to} must leave the task unchanged");
                }
            }
        }
    }

    #[test]
    fn test_leaving_blocked_clears_reason() {
        let mut task = make_task(TaskStatus::Blocked);
        task.block_reason = Some(BlockReason::Manual { reason: "waiting on vendor".into() });
        task.transition(TaskStatus::Pending, &ActorId::system(), Utc::now()).unwrap();
        assert!(task.block_reason.is_none());
    }

    #[test]
    fn test_archived_is_a_dead_end() {
        assert!(TaskStatus::Archived.allowed_transitions().is_empty());
    }

    #[test]
    fn test_failed_transition_counts_retries() {
        let mut task = make_task(TaskStatus::InProgress);
        task.transition(TaskStatus::Failed, &ActorId::system(), Utc::now()).unwrap();
        assert_eq!(task.retry_count, 1);
        assert!(!task.retries_exhausted());
    }

    #[test]
    fn test_hierarchy_derived_from_parent() {
        let now = Utc::now();
        let org = OrganizationId::new("acme");
        let root = Task::from_spec(TaskSpec::new(org.clone(), "root"), None, 3, now);
        let child = Task::from_spec(TaskSpec::new(org.clone(), "child").with_parent(root.id), Some(&root), 3, now);
        let grandchild = Task::from_spec(TaskSpec::new(org, "leaf").with_parent(child.id), Some(&child), 3, now);

        assert_eq!(root.root_id, root.id);
        assert_eq!(root.level, 0);
        assert_eq!(child.root_id, root.id);
        assert_eq!(child.level, 1);
        assert_eq!(grandchild.root_id, root.id);
        assert_eq!(grandchild.level, 2);
        assert_eq!(grandchild.parent_id, Some(child.id));
    }

    #[test]
    fn test_archived_success_depends_on_completion() {
        let mut task = make_task(TaskStatus::Archived);
        assert!(!task.succeeded());
        assert!(task.terminally_failed());

        task.completed_at = Some(Utc::now());
        assert!(task.succeeded());
        assert!(!task.terminally_failed());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::Urgent);
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_filter_excludes_tombstones_by_default() {
        let mut task = make_task(TaskStatus::Pending);
        task.deleted_at = Some(Utc::now());
        assert!(!TaskFilter::default().matches(&task));
        assert!(TaskFilter { include_deleted: true, ..Default::default() }.matches(&task));
    }
}
