//! Locally hosted workers declared under `[[workers]]` in `convoy.toml`.

use convoy_orchestrator::{EchoWorker, InProcessBus, Supervisor, Worker, WorkerHost};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// What a configured worker does with the tasks it receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Answer every task with its requirements.
    #[default]
    Echo,
    /// Fail every task. Useful to exercise retries.
    Fail,
}

/// One `[[workers]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerConfig {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub mode: WorkerMode,
    /// Failure reason reported in `fail` mode.
    #[serde(default)]
    pub failure: Option<String>,
}

impl WorkerConfig {
    fn build(&self) -> Arc<dyn Worker> {
        match self.mode {
            WorkerMode::Echo => Arc::new(EchoWorker::new(self.capabilities.clone())),
            WorkerMode::Fail => Arc::new(EchoWorker::failing(
                self.capabilities.clone(),
                self.failure
                    .clone()
                    .unwrap_or_else(|| "worker configured to fail".to_string()),
            )),
        }
    }
}

/// Register and serve every configured worker whose id is not registered
/// yet. Returns the ids that were started.
pub fn host_new(
    supervisor: &Supervisor,
    bus: &Arc<InProcessBus>,
    configs: &[WorkerConfig],
) -> Vec<String> {
    let mut started = Vec::new();
    for config in configs {
        if supervisor.registry().contains(&config.agent_id) {
            continue;
        }
        let host = WorkerHost::new(
            config.agent_id.clone(),
            config.agent_type.clone(),
            config.build(),
            bus.clone(),
        );
        supervisor.register_agent(&config.agent_id, host.info());
        host.spawn(bus.subscribe(config.agent_id.clone()));
        info!(
            agent_id = %config.agent_id,
            agent_type = %config.agent_type,
            mode = ?config.mode,
            "Local worker started"
        );
        started.push(config.agent_id.clone());
    }
    started
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_core::TaskStatus;
    use convoy_orchestrator::{OrchestratorConfig, TaskSpec};
    use convoy_store::{AuditLog, MemoryTaskStore};
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Workers {
        workers: Vec<WorkerConfig>,
    }

    fn parse(toml_str: &str) -> Vec<WorkerConfig> {
        toml::from_str::<Workers>(toml_str).unwrap().workers
    }

    #[test]
    fn test_parse_worker_entries() {
        let workers = parse(
            r#"
[[workers]]
agent_id = "collector-1"
agent_type = "collector"
capabilities = ["fetch"]

[[workers]]
agent_id = "flaky"
agent_type = "analyzer"
capabilities = ["analyze"]
mode = "fail"
failure = "model offline"
"#,
        );
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].mode, WorkerMode::Echo);
        assert_eq!(workers[1].mode, WorkerMode::Fail);
        assert_eq!(workers[1].failure.as_deref(), Some("model offline"));
    }

    #[tokio::test]
    async fn test_host_new_skips_registered_workers() {
        let bus = Arc::new(InProcessBus::new());
        let config = OrchestratorConfig::default();
        let inbound = bus.subscribe(config.supervisor_id.clone());
        let supervisor = Supervisor::new(
            config,
            Arc::new(MemoryTaskStore::new()),
            bus.clone(),
            Arc::new(AuditLog::in_memory(64)),
        )
        .unwrap();
        let _background = supervisor.start(inbound).unwrap();

        let workers = parse(
            r#"
[[workers]]
agent_id = "collector-1"
agent_type = "collector"
capabilities = ["fetch"]
"#,
        );
        assert_eq!(host_new(&supervisor, &bus, &workers), vec!["collector-1"]);
        assert!(host_new(&supervisor, &bus, &workers).is_empty());
        assert_eq!(supervisor.list_agents().len(), 1);

        let id = supervisor
            .create_task(TaskSpec::new("fetch"))
            .await
            .unwrap();
        let task = supervisor
            .wait_for_task(id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
}
