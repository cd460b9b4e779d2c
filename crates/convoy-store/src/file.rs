use crate::memory::MemoryTaskStore;
use crate::store::{TaskQuery, TaskStore, WorkflowQuery};
use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult, Task, Workflow};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// File-based store: one pretty-printed JSON document per record under
/// `tasks/` and `workflows/`. Queries are answered from an in-memory index
/// rebuilt from disk on open.
pub struct FileTaskStore {
    dir: PathBuf,
    index: MemoryTaskStore,
}

impl FileTaskStore {
    /// Open (or create) a store rooted at `dir` and load every record.
    pub async fn open(dir: PathBuf) -> ConvoyResult<Self> {
        tokio::fs::create_dir_all(dir.join("tasks")).await?;
        tokio::fs::create_dir_all(dir.join("workflows")).await?;

        let index = MemoryTaskStore::new();
        for task in load_all::<Task>(&dir.join("tasks")).await? {
            index.save_task(&task).await?;
        }
        for workflow in load_all::<Workflow>(&dir.join("workflows")).await? {
            index.save_workflow(&workflow).await?;
        }
        info!(
            dir = %dir.display(),
            tasks = index.task_count(),
            workflows = index.workflow_count(),
            "Task store opened"
        );
        Ok(Self { dir, index })
    }

    fn task_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("tasks").join(format!("{id}.json"))
    }

    fn workflow_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("workflows").join(format!("{id}.json"))
    }
}

/// Write through a temporary file so a crash never leaves a torn document.
async fn write_document<T: Serialize>(path: &Path, value: &T) -> ConvoyResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_all<T: DeserializeOwned>(dir: &Path) -> ConvoyResult<Vec<T>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let data = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str(&data) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
        }
    }
    Ok(records)
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save_task(&self, task: &Task) -> ConvoyResult<()> {
        write_document(&self.task_path(task.id), task)
            .await
            .map_err(|e| ConvoyError::Store(format!("failed to persist task {}: {e}", task.id)))?;
        self.index.save_task(task).await
    }

    async fn get_task(&self, id: Uuid) -> ConvoyResult<Option<Task>> {
        self.index.get_task(id).await
    }

    async fn find_tasks(&self, query: &TaskQuery) -> ConvoyResult<Vec<Task>> {
        self.index.find_tasks(query).await
    }

    async fn save_workflow(&self, workflow: &Workflow) -> ConvoyResult<()> {
        write_document(&self.workflow_path(workflow.id), workflow)
            .await
            .map_err(|e| {
                ConvoyError::Store(format!("failed to persist workflow {}: {e}", workflow.id))
            })?;
        self.index.save_workflow(workflow).await
    }

    async fn get_workflow(&self, id: Uuid) -> ConvoyResult<Option<Workflow>> {
        self.index.get_workflow(id).await
    }

    async fn find_workflows(&self, query: &WorkflowQuery) -> ConvoyResult<Vec<Workflow>> {
        self.index.find_workflows(query).await
    }
}
