use convoy_core::{Task, TaskStatus, Workflow};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Shared handle to a cached task. Holding the lock makes the holder the
/// task's only writer.
pub type TaskSlot = Arc<Mutex<Task>>;

/// In-memory cache of tasks the orchestrator is working on.
///
/// Advisory only: the store stays authoritative and the cache can be
/// rebuilt from it. Every mutation of a task goes through its slot's lock,
/// which serializes competing transitions (response vs. timeout vs. cancel).
#[derive(Default)]
pub struct ActiveTasks {
    slots: RwLock<HashMap<Uuid, TaskSlot>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `task` unless a slot already exists; returns the slot in use.
    pub fn insert(&self, task: Task) -> TaskSlot {
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry(task.id)
                .or_insert_with(|| Arc::new(Mutex::new(task))),
        )
    }

    pub fn get(&self, id: Uuid) -> Option<TaskSlot> {
        self.slots.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.slots.read().keys().copied().collect()
    }

    /// Number of cached tasks currently IN_PROGRESS. Slots being mutated are
    /// skipped.
    pub fn in_progress(&self) -> u32 {
        let slots: Vec<TaskSlot> = self.slots.read().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| slot.try_lock().ok().map(|t| t.status))
            .filter(|s| *s == TaskStatus::InProgress)
            .count() as u32
    }

    /// Drop terminal tasks from the cache. Slots that are locked are kept
    /// for the next sweep. Returns how many were evicted.
    pub fn evict_terminal(&self) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(task) => !task.status.is_terminal(),
            Err(_) => true,
        });
        before - slots.len()
    }
}

/// Latest known state of workflows plus their executor handles.
#[derive(Default)]
pub struct ActiveWorkflows {
    entries: RwLock<HashMap<Uuid, Workflow>>,
    executors: parking_lot::Mutex<HashMap<Uuid, tokio::task::JoinHandle<()>>>,
}

impl ActiveWorkflows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, workflow: &Workflow) {
        self.entries.write().insert(workflow.id, workflow.clone());
    }

    pub fn get(&self, id: Uuid) -> Option<Workflow> {
        self.entries.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_executor(&self, id: Uuid, handle: tokio::task::JoinHandle<()>) {
        if let Some(previous) = self.executors.lock().insert(id, handle) {
            previous.abort();
        }
    }

    pub fn take_executor(&self, id: Uuid) -> Option<tokio::task::JoinHandle<()>> {
        self.executors.lock().remove(&id)
    }

    /// Drop terminal workflows and finished executor handles.
    pub fn evict_terminal(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, w| !w.status.is_terminal());
        self.executors.lock().retain(|_, h| !h.is_finished());
        before - entries.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_core::{WorkflowStatus, WorkflowStep};

    #[tokio::test]
    async fn test_insert_keeps_existing_slot() {
        let cache = ActiveTasks::new();
        let task = Task::new("fetch", "first");
        let id = task.id;
        let slot = cache.insert(task.clone());
        slot.lock().await.description = "changed".into();

        let again = cache.insert(task);
        assert_eq!(again.lock().await.description, "changed");
        assert_eq!(cache.len(), 1);
        assert!(cache.get(id).is_some());
    }

    #[tokio::test]
    async fn test_evict_terminal_tasks() {
        let cache = ActiveTasks::new();
        let pending = cache.insert(Task::new("fetch", ""));
        let mut done = Task::new("fetch", "");
        done.start("a", Uuid::new_v4()).unwrap();
        done.complete(Default::default()).unwrap();
        cache.insert(done);

        assert_eq!(cache.evict_terminal(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ids(), vec![pending.lock().await.id]);
    }

    #[tokio::test]
    async fn test_locked_slot_survives_sweep() {
        let cache = ActiveTasks::new();
        let mut task = Task::new("fetch", "");
        task.fail("boom").unwrap();
        let slot = cache.insert(task);
        let _guard = slot.lock().await;
        assert_eq!(cache.evict_terminal(), 0);
    }

    #[test]
    fn test_workflow_eviction() {
        let cache = ActiveWorkflows::new();
        let mut done = Workflow::new("a", "", vec![WorkflowStep::new("s1", "c", "fetch")]);
        done.set_status(WorkflowStatus::Completed);
        let running = Workflow::new("b", "", vec![WorkflowStep::new("s1", "c", "fetch")]);
        cache.upsert(&done);
        cache.upsert(&running);
        assert_eq!(cache.evict_terminal(), 1);
        assert!(cache.get(running.id).is_some());
        assert!(cache.get(done.id).is_none());
    }
}
