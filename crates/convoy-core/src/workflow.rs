use crate::error::{ConvoyError, ConvoyResult};
use crate::task::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Aggregate status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 5] = [
        WorkflowStatus::Pending,
        WorkflowStatus::InProgress,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One node of a workflow's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    /// Agent type required to run this step.
    pub agent_type: String,
    /// Capability tag of the task created for this step.
    pub task_type: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Passed to the worker as the task's requirements.
    #[serde(default)]
    pub parameters: Payload,
    /// Deadline in seconds for the step's task.
    #[serde(default = "default_step_timeout")]
    pub timeout: u64,
}

fn default_step_timeout() -> u64 {
    300
}

impl WorkflowStep {
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            task_type: task_type.into(),
            depends_on: Vec::new(),
            parameters: Payload::new(),
            timeout: default_step_timeout(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: Payload) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// True when every dependency is in `completed`.
    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.depends_on.iter().all(|dep| completed.contains(dep))
    }
}

/// A named DAG of steps executed to a single outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    /// Step id -> id of the task created for it.
    #[serde(default)]
    pub step_tasks: HashMap<String, Uuid>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Workflow {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            steps,
            created_at: now,
            updated_at: now,
            status: WorkflowStatus::Pending,
            step_tasks: HashMap::new(),
            error_message: None,
        }
    }

    /// Reject empty workflows, duplicate step ids and references to
    /// undeclared steps. Cycles are left to the executor, which fails the
    /// workflow with a circular dependency error when it stalls.
    pub fn validate(&self) -> ConvoyResult<()> {
        if self.steps.is_empty() {
            return Err(ConvoyError::InvalidWorkflow(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(ConvoyError::InvalidWorkflow(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }
        for step in &self.steps {
            if let Some(missing) = step.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(ConvoyError::InvalidWorkflow(format!(
                    "step '{}' depends on unknown step '{missing}'",
                    step.id
                )));
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn fan_out() -> Workflow {
        Workflow::new(
            "report",
            "fetch then analyze twice",
            vec![
                WorkflowStep::new("s1", "collector", "fetch"),
                WorkflowStep::new("s2", "analyzer", "analyze").depends_on(["s1"]),
                WorkflowStep::new("s3", "analyzer", "summarize").depends_on(["s1"]),
            ],
        )
    }

    #[test]
    fn test_valid_workflow() {
        let wf = fan_out();
        assert!(wf.validate().is_ok());
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert_eq!(wf.step("s2").unwrap().depends_on, vec!["s1".to_string()]);
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let wf = Workflow::new(
            "dup",
            "",
            vec![
                WorkflowStep::new("a", "x", "t"),
                WorkflowStep::new("a", "x", "t"),
            ],
        );
        let err = wf.validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_workflow");
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let wf = Workflow::new(
            "dangling",
            "",
            vec![WorkflowStep::new("a", "x", "t").depends_on(["ghost"])],
        );
        assert!(wf.validate().unwrap_err().to_string().contains("ghost"));
    }

    #[test]
    fn test_cycle_passes_validation() {
        let wf = Workflow::new(
            "loop",
            "",
            vec![
                WorkflowStep::new("a", "x", "t").depends_on(["b"]),
                WorkflowStep::new("b", "x", "t").depends_on(["a"]),
            ],
        );
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(Workflow::new("empty", "", vec![]).validate().is_err());
    }

    #[test]
    fn test_step_readiness() {
        let wf = fan_out();
        let mut completed = HashSet::new();
        assert!(wf.step("s1").unwrap().is_ready(&completed));
        assert!(!wf.step("s2").unwrap().is_ready(&completed));
        completed.insert("s1".to_string());
        assert!(wf.step("s2").unwrap().is_ready(&completed));
    }

    #[test]
    fn test_step_defaults_from_json() {
        let step: WorkflowStep = serde_json::from_str(
            r#"{"id":"s1","agent_type":"collector","task_type":"fetch"}"#,
        )
        .unwrap();
        assert_eq!(step.timeout, 300);
        assert!(step.depends_on.is_empty());
        assert!(step.parameters.is_empty());
    }
}
