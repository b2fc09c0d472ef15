//! Per-stage task templates and policies.

use std::collections::BTreeMap;

use devflow_core::{Priority, WorkflowStage};
use serde::{Deserialize, Serialize};

/// A task the engine creates when a stage is entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Task name
    pub name: String,
    /// Task description
    #[serde(default)]
    pub description: String,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
    /// Retry budget; scheduler default when unset
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Integration operation invoked when the task is dispatched
    #[serde(default)]
    pub operation: Option<String>,
    /// A terminal failure sends the workflow to `error`
    #[serde(default = "default_true")]
    pub required: bool,
    /// Tasks of the next stage depend on this one
    #[serde(default)]
    pub key_deliverable: bool,
}

fn default_true() -> bool {
    true
}

impl TaskTemplate {
    /// A required, non-deliverable task.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority: Priority::Normal,
            max_retries: None,
            operation: None,
            required: true,
            key_deliverable: false,
        }
    }

    /// Set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Bind an integration operation.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Failures of this task do not stop the stage.
    pub fn tolerated(mut self) -> Self {
        self.required = false;
        self
    }

    /// Mark as the stage's key deliverable.
    pub fn key_deliverable(mut self) -> Self {
        self.key_deliverable = true;
        self
    }
}

/// What a stage binds and how long it may take.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePolicy {
    /// Tasks created on entry, in ordinal order
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
    /// Seconds before the stage is forced into `error`
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StagePolicy {
    /// Policy with the given templates and no timeout.
    pub fn new(tasks: Vec<TaskTemplate>) -> Self {
        Self { tasks, timeout_secs: None }
    }

    /// Set the stage timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Policies for every stage of the main sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    stages: BTreeMap<WorkflowStage, StagePolicy>,
}

impl Blueprint {
    /// An empty blueprint; every stage binds nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The default development pipeline.
    pub fn standard() -> Self {
        use WorkflowStage::*;

        Self::empty()
            .with_stage(
                ProjectSelection,
                StagePolicy::new(vec![TaskTemplate::new("select project").key_deliverable()]),
            )
            .with_stage(
                RequirementsInput,
                StagePolicy::new(vec![TaskTemplate::new("capture requirements").key_deliverable()]),
            )
            .with_stage(
                RequirementsDecomposition,
                StagePolicy::new(vec![
                    TaskTemplate::new("decompose requirements").key_deliverable(),
                    TaskTemplate::new("estimate effort").with_priority(Priority::Low).tolerated(),
                ]),
            )
            .with_stage(
                IssueCreation,
                StagePolicy::new(vec![TaskTemplate::new("create tracking issues")
                    .with_operation("create_issue")
                    .key_deliverable()]),
            )
            .with_stage(
                TaskExecution,
                StagePolicy::new(vec![TaskTemplate::new("run generation")
                    .with_operation("run_generation")
                    .with_priority(Priority::High)
                    .key_deliverable()]),
            )
            .with_stage(
                Validation,
                StagePolicy::new(vec![TaskTemplate::new("validate results")
                    .with_operation("run_validation")
                    .key_deliverable()]),
            )
            .with_stage(
                Completion,
                StagePolicy::new(vec![TaskTemplate::new("finalize run")]),
            )
    }

    /// Replace the policy for `stage`.
    pub fn with_stage(mut self, stage: WorkflowStage, policy: StagePolicy) -> Self {
        self.stages.insert(stage, policy);
        self
    }

    /// Set a timeout on an existing stage policy.
    pub fn with_timeout(mut self, stage: WorkflowStage, secs: u64) -> Self {
        self.stages.entry(stage).or_default().timeout_secs = Some(secs);
        self
    }

    /// Policy for `stage`, if any.
    pub fn policy(&self, stage: WorkflowStage) -> Option<&StagePolicy> {
        self.stages.get(&stage)
    }

    /// Template at `ordinal` in `stage`.
    pub fn template(&self, stage: WorkflowStage, ordinal: u32) -> Option<&TaskTemplate> {
        self.policy(stage).and_then(|p| p.tasks.get(ordinal as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_covers_main_sequence() {
        let blueprint = Blueprint::standard();
        for stage in WorkflowStage::SEQUENCE {
            let policy = blueprint.policy(stage).unwrap();
            assert!(!policy.tasks.is_empty(), "{} binds nothing", stage);
        }
        assert!(blueprint.policy(WorkflowStage::Error).is_none());
    }

    #[test]
    fn test_decomposition_tolerates_estimate() {
        let blueprint = Blueprint::standard();
        let estimate = blueprint.template(WorkflowStage::RequirementsDecomposition, 1).unwrap();
        assert!(!estimate.required);
        assert!(!estimate.key_deliverable);
    }

    #[test]
    fn test_with_timeout() {
        let blueprint = Blueprint::standard().with_timeout(WorkflowStage::Validation, 60);
        assert_eq!(blueprint.policy(WorkflowStage::Validation).unwrap().timeout_secs, Some(60));
        assert_eq!(blueprint.policy(WorkflowStage::Validation).unwrap().tasks.len(), 1);
    }

    #[test]
    fn test_template_defaults_from_toml() {
        let policy: StagePolicy = toml::from_str(
            r#"
            timeout_secs = 30

            [[tasks]]
            name = "lint"
            operation = "run_lint"
            "#,
        )
        .unwrap();
        assert_eq!(policy.timeout_secs, Some(30));
        assert!(policy.tasks[0].required);
        assert_eq!(policy.tasks[0].priority, Priority::Normal);
    }
}
