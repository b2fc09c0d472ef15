//! Workflow execution model - a unit of work driven through fixed stages.

use serde::{Deserialize, Serialize};
use crate::id::{ActorId, OrganizationId, TaskId, WorkflowId};
use crate::{ParseEnumError, Time};

/// A workflow execution walks one unit of work through the stage sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique identifier
    pub id: WorkflowId,

    /// Tenant partition key
    pub organization_id: OrganizationId,

    /// The unit of work, e.g. a repository or project run
    pub name: String,

    /// Current stage
    pub current_stage: WorkflowStage,

    /// Lifecycle status
    pub status: WorkflowStatus,

    /// Stage that was active when the workflow entered `error`
    pub failed_stage: Option<WorkflowStage>,

    /// Reason for the last error
    pub last_error: Option<String>,

    /// Stage retries performed
    pub retry_count: u32,

    /// Stage retry budget
    pub max_retries: u32,

    /// Ordered stage history
    pub stage_history: Vec<StageRecord>,

    /// Who registered the workflow
    pub created_by: ActorId,

    /// Optimistic concurrency revision
    pub version: u64,

    /// Created at
    pub created_at: Time,

    /// Updated at
    pub updated_at: Time,
}

impl WorkflowExecution {
    /// A draft workflow positioned at the first stage.
    pub fn new(
        organization_id: OrganizationId,
        name: impl Into<String>,
        max_retries: u32,
        created_by: ActorId,
        now: Time,
    ) -> Self {
        Self {
            id: WorkflowId::new(),
            organization_id,
            name: name.into(),
            current_stage: WorkflowStage::first(),
            status: WorkflowStatus::Draft,
            failed_stage: None,
            last_error: None,
            retry_count: 0,
            max_retries,
            stage_history: Vec::new(),
            created_by,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record entry into `stage` and make it current.
    pub fn enter_stage(&mut self, stage: WorkflowStage, now: Time) {
        self.stage_history.push(StageRecord {
            stage,
            entered_at: now,
            exited_at: None,
            outcome: None,
            note: None,
        });
        self.current_stage = stage;
    }

    /// Close the open history record, if any.
    pub fn exit_stage(&mut self, outcome: StageOutcome, note: Option<String>, now: Time) {
        if let Some(record) = self.stage_history.iter_mut().rev().find(|r| r.exited_at.is_none()) {
            record.exited_at = Some(now);
            record.outcome = Some(outcome);
            record.note = note;
        }
    }

    /// When the current stage was entered.
    pub fn stage_entered_at(&self) -> Option<Time> {
        self.stage_history
            .iter()
            .rev()
            .find(|r| r.stage == self.current_stage && r.exited_at.is_none())
            .map(|r| r.entered_at)
    }

    /// Bump the revision and update timestamp.
    pub fn touch(&mut self, now: Time) {
        self.version += 1;
        self.updated_at = now;
    }
}

/// Workflow stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    /// Pick the project or repository to work on
    ProjectSelection,
    /// Capture requirements
    RequirementsInput,
    /// Break requirements into tasks
    RequirementsDecomposition,
    /// Create external tracking issues
    IssueCreation,
    /// Run the work
    TaskExecution,
    /// Validate results
    Validation,
    /// Wrap up
    Completion,
    /// Something failed; waiting for retry or cancellation
    Error,
}

impl WorkflowStage {
    /// The main sequence. `Error` sits outside it.
    pub const SEQUENCE: [WorkflowStage; 7] = [
        WorkflowStage::ProjectSelection,
        WorkflowStage::RequirementsInput,
        WorkflowStage::RequirementsDecomposition,
        WorkflowStage::IssueCreation,
        WorkflowStage::TaskExecution,
        WorkflowStage::Validation,
        WorkflowStage::Completion,
    ];

    /// First stage of every workflow.
    pub fn first() -> Self {
        Self::SEQUENCE[0]
    }

    /// Position in the main sequence; `None` for `Error`.
    pub fn position(self) -> Option<usize> {
        Self::SEQUENCE.iter().position(|s| *s == self)
    }

    /// The stage after this one, if any.
    pub fn next(self) -> Option<WorkflowStage> {
        self.position().and_then(|i| Self::SEQUENCE.get(i + 1).copied())
    }

    /// Whether a move from `self` to `next` respects the ordering.
    ///
    /// Forward by exactly one, into `Error` from anywhere, or out of `Error`
    /// back to the stage that failed.
    pub fn allows(self, next: WorkflowStage, failed_stage: Option<WorkflowStage>) -> bool {
        match (self, next) {
            (WorkflowStage::Error, WorkflowStage::Error) => false,
            (_, WorkflowStage::Error) => true,
            (WorkflowStage::Error, target) => failed_stage == Some(target),
            (current, target) => current.next() == Some(target),
        }
    }

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStage::ProjectSelection => "project_selection",
            WorkflowStage::RequirementsInput => "requirements_input",
            WorkflowStage::RequirementsDecomposition => "requirements_decomposition",
            WorkflowStage::IssueCreation => "issue_creation",
            WorkflowStage::TaskExecution => "task_execution",
            WorkflowStage::Validation => "validation",
            WorkflowStage::Completion => "completion",
            WorkflowStage::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStage {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        Self::SEQUENCE
            .into_iter()
            .chain(std::iter::once(WorkflowStage::Error))
            .find(|stage| stage.as_str() == lowered)
            .ok_or_else(|| ParseEnumError::new("workflow stage", s))
    }
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Registered, not started
    Draft,
    /// Running
    Active,
    /// Temporarily halted
    Paused,
    /// Finished all stages
    Completed,
    /// Stage retries exhausted
    Failed,
    /// Cancelled by an operator
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How a stage was left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Moved on to the next stage
    Advanced,
    /// Entered `error`
    Errored,
    /// Left `error` through a retry
    Retried,
    /// Final stage finished
    Completed,
    /// Workflow cancelled
    Cancelled,
    /// Workflow failed terminally
    Failed,
}

/// One entry of the stage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage
    pub stage: WorkflowStage,
    /// Entered at
    pub entered_at: Time,
    /// Exited at
    pub exited_at: Option<Time>,
    /// Outcome
    pub outcome: Option<StageOutcome>,
    /// Free-form note, e.g. the error reason
    pub note: Option<String>,
}

/// Join entity binding a task to a workflow stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBinding {
    /// Workflow
    pub workflow_id: WorkflowId,
    /// Stage tag
    pub stage: WorkflowStage,
    /// Ordering within the stage; also the blueprint template index
    pub ordinal: u32,
    /// Bound task
    pub task_id: TaskId,
    /// A terminal failure of this task sends the workflow to `error`
    pub required: bool,
    /// Later stages depend on this task
    pub key_deliverable: bool,
    /// Incremented each time the task is replaced by a stage retry
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_sequence_order() {
        assert_eq!(WorkflowStage::first(), WorkflowStage::ProjectSelection);
        assert_eq!(WorkflowStage::RequirementsDecomposition.next(), Some(WorkflowStage::IssueCreation));
        assert_eq!(WorkflowStage::Completion.next(), None);
        assert_eq!(WorkflowStage::Error.next(), None);
        assert_eq!(WorkflowStage::Error.position(), None);
    }

    #[test]
    fn test_stage_transitions() {
        use WorkflowStage::*;
        assert!(RequirementsInput.allows(RequirementsDecomposition, None));
        assert!(!RequirementsInput.allows(IssueCreation, None), "no skipping");
        assert!(!Validation.allows(TaskExecution, None), "no going back");
        assert!(Validation.allows(Error, None));
        assert!(Error.allows(Validation, Some(Validation)));
        assert!(!Error.allows(Completion, Some(Validation)));
        assert!(!Error.allows(Error, Some(Validation)));
    }

    #[test]
    fn test_history_records_enter_and_exit() {
        let now = Utc::now();
        let mut wf = WorkflowExecution::new(OrganizationId::new("acme"), "repo", 2, ActorId::system(), now);
        wf.enter_stage(WorkflowStage::ProjectSelection, now);
        assert_eq!(wf.stage_entered_at(), Some(now));

        wf.exit_stage(StageOutcome::Advanced, None, now);
        wf.enter_stage(WorkflowStage::RequirementsInput, now);

        assert_eq!(wf.stage_history.len(), 2);
        assert_eq!(wf.stage_history[0].outcome, Some(StageOutcome::Advanced));
        assert!(wf.stage_history[1].exited_at.is_none());
        assert_eq!(wf.current_stage, WorkflowStage::RequirementsInput);
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!("issue_creation".parse::<WorkflowStage>().unwrap(), WorkflowStage::IssueCreation);
        assert_eq!("error".parse::<WorkflowStage>().unwrap(), WorkflowStage::Error);
    }
}
