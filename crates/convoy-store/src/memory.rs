use crate::store::{TaskQuery, TaskStore, WorkflowQuery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::{ConvoyResult, Task, TaskStatus, Workflow, WorkflowStatus};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use uuid::Uuid;

type CreatedKey = (DateTime<Utc>, Uuid);

fn created_range(
    set: &BTreeSet<CreatedKey>,
    after: Option<DateTime<Utc>>,
) -> impl Iterator<Item = &CreatedKey> {
    let lower = match after {
        Some(t) => Bound::Included((t, Uuid::nil())),
        None => Bound::Unbounded,
    };
    set.range((lower, Bound::Unbounded))
}

#[derive(Default)]
struct TaskTable {
    records: HashMap<Uuid, Task>,
    by_status: HashMap<TaskStatus, BTreeSet<CreatedKey>>,
    by_agent: HashMap<String, BTreeSet<CreatedKey>>,
    by_created: BTreeSet<CreatedKey>,
}

impl TaskTable {
    fn upsert(&mut self, task: Task) {
        let key = (task.created_at, task.id);
        if let Some(old) = self.records.get(&task.id) {
            if let Some(set) = self.by_status.get_mut(&old.status) {
                set.remove(&key);
            }
            if let Some(agent) = &old.assigned_agent {
                if let Some(set) = self.by_agent.get_mut(agent) {
                    set.remove(&key);
                }
            }
        }
        self.by_status.entry(task.status).or_default().insert(key);
        if let Some(agent) = &task.assigned_agent {
            self.by_agent.entry(agent.clone()).or_default().insert(key);
        }
        self.by_created.insert(key);
        self.records.insert(task.id, task);
    }

    fn query(&self, query: &TaskQuery) -> Vec<Task> {
        let empty = BTreeSet::new();
        let index = if let Some(status) = query.status {
            self.by_status.get(&status).unwrap_or(&empty)
        } else if let Some(agent) = &query.assigned_agent {
            self.by_agent.get(agent).unwrap_or(&empty)
        } else {
            &self.by_created
        };
        created_range(index, query.created_after)
            .filter_map(|(_, id)| self.records.get(id))
            .filter(|t| query.matches(t))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct WorkflowTable {
    records: HashMap<Uuid, Workflow>,
    by_status: HashMap<WorkflowStatus, BTreeSet<CreatedKey>>,
    by_created: BTreeSet<CreatedKey>,
}

impl WorkflowTable {
    fn upsert(&mut self, workflow: Workflow) {
        let key = (workflow.created_at, workflow.id);
        if let Some(old) = self.records.get(&workflow.id) {
            if let Some(set) = self.by_status.get_mut(&old.status) {
                set.remove(&key);
            }
        }
        self.by_status.entry(workflow.status).or_default().insert(key);
        self.by_created.insert(key);
        self.records.insert(workflow.id, workflow);
    }

    fn query(&self, query: &WorkflowQuery) -> Vec<Workflow> {
        let empty = BTreeSet::new();
        let index = match query.status {
            Some(status) => self.by_status.get(&status).unwrap_or(&empty),
            None => &self.by_created,
        };
        created_range(index, query.created_after)
            .filter_map(|(_, id)| self.records.get(id))
            .filter(|w| query.matches(w))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// In-memory store with secondary indexes on status, assigned agent and
/// creation time. Also serves as the index layer of
/// [`FileTaskStore`](crate::FileTaskStore).
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<TaskTable>,
    workflows: RwLock<WorkflowTable>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().records.len()
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.read().records.len()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save_task(&self, task: &Task) -> ConvoyResult<()> {
        self.tasks.write().upsert(task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> ConvoyResult<Option<Task>> {
        Ok(self.tasks.read().records.get(&id).cloned())
    }

    async fn find_tasks(&self, query: &TaskQuery) -> ConvoyResult<Vec<Task>> {
        Ok(self.tasks.read().query(query))
    }

    async fn save_workflow(&self, workflow: &Workflow) -> ConvoyResult<()> {
        self.workflows.write().upsert(workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> ConvoyResult<Option<Workflow>> {
        Ok(self.workflows.read().records.get(&id).cloned())
    }

    async fn find_workflows(&self, query: &WorkflowQuery) -> ConvoyResult<Vec<Workflow>> {
        Ok(self.workflows.read().query(query))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_core::WorkflowStep;

    #[tokio::test]
    async fn test_status_index_follows_updates() {
        let store = MemoryTaskStore::new();
        let mut task = Task::new("fetch", "");
        store.save_task(&task).await.unwrap();
        assert_eq!(store.count_tasks(Some(TaskStatus::Pending)).await.unwrap(), 1);

        task.start("agent-a", Uuid::new_v4()).unwrap();
        store.save_task(&task).await.unwrap();

        assert_eq!(store.count_tasks(Some(TaskStatus::Pending)).await.unwrap(), 0);
        assert_eq!(
            store.count_tasks(Some(TaskStatus::InProgress)).await.unwrap(),
            1
        );
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn test_agent_index_drops_on_retry() {
        let store = MemoryTaskStore::new();
        let mut task = Task::new("fetch", "").with_max_retries(1);
        task.start("agent-a", Uuid::new_v4()).unwrap();
        store.save_task(&task).await.unwrap();
        let by_agent = TaskQuery::all().assigned_to("agent-a");
        assert_eq!(store.find_tasks(&by_agent).await.unwrap().len(), 1);

        task.fail("boom").unwrap();
        task.reset_for_retry().unwrap();
        store.save_task(&task).await.unwrap();
        assert!(store.find_tasks(&by_agent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_created_after_and_limit() {
        let store = MemoryTaskStore::new();
        let mut old = Task::new("fetch", "old");
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        store.save_task(&old).await.unwrap();
        for i in 0..3 {
            store
                .save_task(&Task::new("fetch", format!("new {i}")))
                .await
                .unwrap();
        }

        let recent = TaskQuery::all().created_after(Utc::now() - chrono::Duration::hours(1));
        assert_eq!(store.find_tasks(&recent).await.unwrap().len(), 3);

        let first_two = TaskQuery::all().limit(2);
        let tasks = store.find_tasks(&first_two).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].description, "old");
    }

    #[tokio::test]
    async fn test_unfinished_workflows() {
        let store = MemoryTaskStore::new();
        let steps = vec![WorkflowStep::new("s1", "collector", "fetch")];
        let mut running = Workflow::new("a", "", steps.clone());
        running.set_status(WorkflowStatus::InProgress);
        let mut done = Workflow::new("b", "", steps);
        done.set_status(WorkflowStatus::Completed);
        store.save_workflow(&running).await.unwrap();
        store.save_workflow(&done).await.unwrap();

        let unfinished = store.unfinished_workflows().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, running.id);
        assert_eq!(store.workflow_count(), 2);
    }
}
