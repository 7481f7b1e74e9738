//! Workflows as data: named, ordered steps with their own cleanup.

use crate::action::Action;
use crate::verify::VerificationClaim;
use crate::wait::WaitCondition;
use std::fmt;

/// Entity created by a step, and how to remove it
#[derive(Debug)]
pub struct EntityRegistration {
    /// Entity kind, e.g. "contact"
    pub kind: String,
    /// Identifying key, e.g. the generated name
    pub key: String,
    /// Workflow that removes the entity
    pub cleanup: Workflow,
}

impl EntityRegistration {
    /// Create a registration
    #[must_use]
    pub fn new(kind: impl Into<String>, key: impl Into<String>, cleanup: Workflow) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            cleanup,
        }
    }
}

/// One step of a workflow
#[derive(Debug)]
pub enum WorkflowStep {
    /// Perform an action; `creates` registers test data once the interaction happened
    Action {
        /// The action
        action: Action,
        /// Entity created by the action
        creates: Option<EntityRegistration>,
    },
    /// Assert a claim. Delta and unchanged claims compare against one
    /// snapshot taken right before the first action or nested workflow of
    /// the enclosing step list; with no such step before them they fail.
    Verify(VerificationClaim),
    /// Run a nested workflow; `creates` registers test data whenever the
    /// nested workflow interacted with the page, even if it later failed
    Workflow {
        /// The nested workflow
        workflow: Box<Workflow>,
        /// Entity created by the nested workflow
        creates: Option<EntityRegistration>,
    },
    /// Navigate to a path (joined to the base URL) or an absolute URL
    Navigate(String),
    /// Wait for a condition
    Wait(WaitCondition),
}

impl WorkflowStep {
    /// Short label for logs and evidence
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Action { action, .. } => action.to_string(),
            Self::Verify(claim) => format!("verify {}", claim.description()),
            Self::Workflow { workflow, .. } => format!("run workflow \"{}\"", workflow.name),
            Self::Navigate(path) => format!("navigate to {path}"),
            Self::Wait(condition) => format!("wait for {}", condition.description()),
        }
    }
}

impl From<Action> for WorkflowStep {
    fn from(action: Action) -> Self {
        Self::Action {
            action,
            creates: None,
        }
    }
}

impl From<VerificationClaim> for WorkflowStep {
    fn from(claim: VerificationClaim) -> Self {
        Self::Verify(claim)
    }
}

impl From<WaitCondition> for WorkflowStep {
    fn from(condition: WaitCondition) -> Self {
        Self::Wait(condition)
    }
}

impl From<Workflow> for WorkflowStep {
    fn from(workflow: Workflow) -> Self {
        Self::Workflow {
            workflow: Box::new(workflow),
            creates: None,
        }
    }
}

/// A named business operation.
///
/// Not `Clone`: an instance runs exactly once. Build a fresh one (with fresh
/// keys) to run again.
#[derive(Debug)]
pub struct Workflow {
    /// Name
    pub name: String,
    /// Steps, run strictly in order until the first failure
    pub steps: Vec<WorkflowStep>,
    /// Cleanup steps, run whatever the outcome
    pub cleanup: Vec<WorkflowStep>,
}

impl Workflow {
    /// Create an empty workflow
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    /// Append a step
    #[must_use]
    pub fn then(mut self, step: impl Into<WorkflowStep>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Append an action that creates an entity
    #[must_use]
    pub fn creating(mut self, action: Action, entity: EntityRegistration) -> Self {
        self.steps.push(WorkflowStep::Action {
            action,
            creates: Some(entity),
        });
        self
    }

    /// Append a nested workflow that creates an entity
    #[must_use]
    pub fn run_creating(mut self, workflow: Self, entity: EntityRegistration) -> Self {
        self.steps.push(WorkflowStep::Workflow {
            workflow: Box::new(workflow),
            creates: Some(entity),
        });
        self
    }

    /// Append a verification
    #[must_use]
    pub fn verify(mut self, claim: VerificationClaim) -> Self {
        self.steps.push(WorkflowStep::Verify(claim));
        self
    }

    /// Append a navigation
    #[must_use]
    pub fn navigate(mut self, path: impl Into<String>) -> Self {
        self.steps.push(WorkflowStep::Navigate(path.into()));
        self
    }

    /// Append a cleanup step
    #[must_use]
    pub fn cleanup(mut self, step: impl Into<WorkflowStep>) -> Self {
        self.cleanup.push(step.into());
        self
    }

    /// Total steps including nested workflows' steps and cleanup
    #[must_use]
    pub fn total_steps(&self) -> usize {
        fn count(steps: &[WorkflowStep]) -> usize {
            steps
                .iter()
                .map(|s| match s {
                    WorkflowStep::Workflow { workflow, .. } => 1 + workflow.total_steps(),
                    _ => 1,
                })
                .sum()
        }
        count(&self.steps) + count(&self.cleanup)
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} steps, {} cleanup)",
            self.name,
            self.steps.len(),
            self.cleanup.len()
        )
    }
}
