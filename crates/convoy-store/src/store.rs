use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::{ConvoyResult, Task, TaskStatus, Workflow, WorkflowStatus};
use uuid::Uuid;

/// Filter for [`TaskStore::find_tasks`]. Unset fields match everything;
/// results are ordered by creation time.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub assigned_agent: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assigned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.assigned_agent = Some(agent_id.into());
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self
                .assigned_agent
                .as_deref()
                .map_or(true, |a| task.assigned_agent.as_deref() == Some(a))
            && self.created_after.map_or(true, |t| task.created_at >= t)
    }
}

/// Filter for [`TaskStore::find_workflows`].
#[derive(Debug, Clone, Default)]
pub struct WorkflowQuery {
    pub status: Option<WorkflowStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl WorkflowQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn matches(&self, workflow: &Workflow) -> bool {
        self.status.map_or(true, |s| workflow.status == s)
            && self.created_after.map_or(true, |t| workflow.created_at >= t)
    }
}

/// Durable record of tasks and workflows; the source of truth across restarts.
///
/// Records are upserted, never deleted.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, task: &Task) -> ConvoyResult<()>;
    async fn get_task(&self, id: Uuid) -> ConvoyResult<Option<Task>>;
    async fn find_tasks(&self, query: &TaskQuery) -> ConvoyResult<Vec<Task>>;

    async fn save_workflow(&self, workflow: &Workflow) -> ConvoyResult<()>;
    async fn get_workflow(&self, id: Uuid) -> ConvoyResult<Option<Workflow>>;
    async fn find_workflows(&self, query: &WorkflowQuery) -> ConvoyResult<Vec<Workflow>>;

    /// Number of tasks with the given status, or of all tasks for `None`.
    async fn count_tasks(&self, status: Option<TaskStatus>) -> ConvoyResult<usize> {
        let query = TaskQuery {
            status,
            ..TaskQuery::default()
        };
        Ok(self.find_tasks(&query).await?.len())
    }

    /// Tasks that have not reached a terminal state.
    async fn unfinished_tasks(&self) -> ConvoyResult<Vec<Task>> {
        let mut tasks = self.find_tasks(&TaskQuery::all().status(TaskStatus::Pending)).await?;
        tasks.extend(
            self.find_tasks(&TaskQuery::all().status(TaskStatus::InProgress))
                .await?,
        );
        Ok(tasks)
    }

    /// Workflows that have not reached a terminal state.
    async fn unfinished_workflows(&self) -> ConvoyResult<Vec<Workflow>> {
        let mut workflows = self
            .find_workflows(&WorkflowQuery::all().status(WorkflowStatus::Pending))
            .await?;
        workflows.extend(
            self.find_workflows(&WorkflowQuery::all().status(WorkflowStatus::InProgress))
                .await?,
        );
        Ok(workflows)
    }
}
