use convoy_core::{Payload, TaskPriority, TaskStatus, WorkflowStatus, WorkflowStep};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to create a single task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub requirements: Payload,
    /// Falls back to the orchestrator's `default_max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Falls back to the orchestrator's `default_task_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: Payload) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }
}

/// Request to create a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
        }
    }
}

/// One step's entry in a [`WorkflowReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub task_id: Option<Uuid>,
    /// `None` until the step's task has been created.
    pub status: Option<TaskStatus>,
    pub error_message: Option<String>,
}

/// Progress of a workflow as returned by get-workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepReport>,
    pub completed_steps: usize,
    pub error_message: Option<String>,
}

impl WorkflowReport {
    pub fn step(&self, step_id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// System-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_agents: usize,
    pub ready_agents: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub active_workflows: usize,
    /// Mean of the ready-agent ratio and the last hour's success rate,
    /// rounded to two decimals.
    pub system_health: f64,
}

/// What [`crate::Supervisor::recover`] replayed from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub tasks_requeued: usize,
    pub tasks_watched: usize,
    pub workflows_resumed: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_spec_from_json() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"type":"fetch","priority":"high","requirements":{"symbol":"AAPL"},"max_retries":2}"#,
        )
        .unwrap();
        assert_eq!(spec.task_type, "fetch");
        assert_eq!(spec.priority, TaskPriority::High);
        assert_eq!(spec.max_retries, Some(2));
        assert_eq!(spec.requirements["symbol"], "AAPL");
        assert!(spec.timeout_secs.is_none());
    }

    #[test]
    fn test_workflow_spec_from_json() {
        let spec: WorkflowSpec = serde_json::from_str(
            r#"{
                "name": "digest",
                "steps": [
                    {"id": "s1", "agent_type": "collector", "task_type": "fetch"},
                    {"id": "s2", "agent_type": "analyzer", "task_type": "analyze",
                     "depends_on": ["s1"], "timeout": 60}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[1].depends_on, vec!["s1"]);
        assert_eq!(spec.steps[1].timeout, 60);
        assert_eq!(spec.steps[0].timeout, 300);
    }
}
