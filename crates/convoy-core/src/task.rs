use crate::error::{ConvoyError, ConvoyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Opaque key-value payload exchanged with workers.
pub type Payload = HashMap<String, serde_json::Value>;

/// Priority of a task. Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Numeric weight carried on the wire envelope.
    pub fn weight(self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Medium => 3,
            TaskPriority::High => 5,
            TaskPriority::Critical => 10,
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Whether the task has reached a resting state.
    ///
    /// `Failed` counts as terminal: the retry loop moves a task back to
    /// `Pending` inside the same critical section that failed it, so a failed
    /// task observed from outside will not move again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (Pending, Cancelled)
                | (InProgress, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of work routed to a capable agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Capability tag the executing agent must advertise.
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    /// Restricts eligibility to agents registered with this type.
    #[serde(default)]
    pub agent_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requirements: Payload,
    pub result: Option<Payload>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Per-task deadline; the orchestrator default applies when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Number of dispatches performed so far.
    #[serde(default)]
    pub attempts: u32,
    /// Message id of the current delivery, used to correlate responses.
    #[serde(default)]
    pub delivery_id: Option<Uuid>,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub step_id: Option<String>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            description: description.into(),
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            agent_type: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            requirements: Payload::new(),
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            timeout_secs: None,
            attempts: 0,
            delivery_id: None,
            workflow_id: None,
            step_id: None,
        }
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
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Tag this task as the execution of a workflow step.
    pub fn for_step(mut self, workflow_id: Uuid, step_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id);
        self.step_id = Some(step_id.into());
        self
    }

    /// Apply a state machine transition, refreshing `updated_at`.
    pub fn transition(&mut self, to: TaskStatus) -> ConvoyResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(ConvoyError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// PENDING -> IN_PROGRESS on a successful hand-off to `agent_id`.
    pub fn start(&mut self, agent_id: impl Into<String>, delivery_id: Uuid) -> ConvoyResult<()> {
        self.transition(TaskStatus::InProgress)?;
        self.assigned_agent = Some(agent_id.into());
        self.delivery_id = Some(delivery_id);
        self.started_at = Some(self.updated_at);
        self.completed_at = None;
        self.attempts += 1;
        Ok(())
    }

    /// IN_PROGRESS -> COMPLETED with the worker's result.
    pub fn complete(&mut self, result: Payload) -> ConvoyResult<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.error_message = None;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Move to FAILED, recording the reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> ConvoyResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.error_message = Some(reason.into());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Whether another retry cycle is allowed.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// FAILED -> PENDING, consuming one retry. The last error is kept for
    /// inspection until the task completes.
    pub fn reset_for_retry(&mut self) -> ConvoyResult<()> {
        if !self.has_retry_budget() {
            return Err(ConvoyError::InvalidTransition {
                from: self.status.to_string(),
                to: "pending (retry budget exhausted)".to_string(),
            });
        }
        self.transition(TaskStatus::Pending)?;
        self.retry_count += 1;
        self.assigned_agent = None;
        self.delivery_id = None;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// PENDING or IN_PROGRESS -> CANCELLED. The assignment is dropped; the
    /// caller releases the agent's load first.
    pub fn cancel(&mut self) -> ConvoyResult<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.assigned_agent = None;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Wall-clock time between dispatch and completion, if both happened.
    pub fn execution_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("fetch", "Fetch prices");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert!(task.assigned_agent.is_none());
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::High < TaskPriority::Critical);
        assert_eq!(TaskPriority::Critical.weight(), 10);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = Task::new("fetch", "");
        let delivery = Uuid::new_v4();
        task.start("agent-a", delivery).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent.as_deref(), Some("agent-a"));
        assert_eq!(task.delivery_id, Some(delivery));
        assert_eq!(task.attempts, 1);

        task.complete(Payload::new()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.execution_time().is_some());
    }

    #[test]
    fn test_completed_is_final() {
        let mut task = Task::new("fetch", "");
        task.start("a", Uuid::new_v4()).unwrap();
        task.complete(Payload::new()).unwrap();
        assert!(task.fail("late").is_err());
        assert!(task.cancel().is_err());
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_retry_cycle_clears_assignment() {
        let mut task = Task::new("fetch", "").with_max_retries(1);
        task.start("a", Uuid::new_v4()).unwrap();
        task.fail("boom").unwrap();
        task.reset_for_retry().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.assigned_agent.is_none());
        assert_eq!(task.error_message.as_deref(), Some("boom"));

        task.start("b", Uuid::new_v4()).unwrap();
        task.fail("boom again").unwrap();
        assert!(task.reset_for_retry().is_err());
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
    }

    #[test]
    fn test_cancel_in_progress_drops_assignment() {
        let mut task = Task::new("fetch", "");
        task.start("agent-a", Uuid::new_v4()).unwrap();
        task.cancel().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.assigned_agent.is_none());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_pending_cannot_complete() {
        let mut task = Task::new("fetch", "");
        let err = task.complete(Payload::new()).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn test_pending_can_fail_without_dispatch() {
        let mut task = Task::new("fetch", "");
        task.fail("no suitable agent available").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.assigned_agent.is_none());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_task_type_serialized_as_type() {
        let task = Task::new("summarize", "");
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "summarize");
    }
}
