use crate::registry::AgentRegistry;
use crate::timeout::TimeoutMonitor;
use crate::transport::Transport;
use convoy_core::{
    ConvoyError, ConvoyResult, Envelope, MessageType, Task, TaskRequest, TaskStatus,
};
use convoy_store::{AuditLog, AuditEntry, AuditOutcome, TaskStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

/// Hands tasks to agents and tracks the in-flight delivery.
///
/// A dispatch marks the task IN_PROGRESS, charges the agent one unit of
/// load, publishes the `task_request` and arms the deadline. A failed send
/// leaves the task FAILED with the load charge undone. Callers hold the
/// task's lock for the whole call.
pub struct Dispatcher {
    sender_id: String,
    default_timeout_secs: u64,
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn TaskStore>,
    timeouts: Arc<TimeoutMonitor>,
    audit: Arc<AuditLog>,
    permits: Semaphore,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender_id: impl Into<String>,
        default_timeout_secs: u64,
        max_concurrent: usize,
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn TaskStore>,
        timeouts: Arc<TimeoutMonitor>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            default_timeout_secs,
            registry,
            transport,
            store,
            timeouts,
            audit,
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }

    /// Deadline applied to `task`, in seconds.
    pub fn deadline_secs(&self, task: &Task) -> u64 {
        task.timeout_secs.unwrap_or(self.default_timeout_secs)
    }

    /// Send `task` to `agent_id`. Returns the delivery id (the id of the
    /// `task_request` envelope), which the agent's response must correlate to.
    ///
    /// On a transport error the task is FAILED and persisted before the
    /// `DispatchFailure` is returned; retrying is up to the caller.
    pub async fn dispatch(&self, task: &mut Task, agent_id: &str) -> ConvoyResult<Uuid> {
        if task.status != TaskStatus::Pending {
            return Err(ConvoyError::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::InProgress.to_string(),
            });
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ConvoyError::DispatchFailure(e.to_string()))?;

        let request = TaskRequest {
            task_id: task.id,
            task_type: task.task_type.clone(),
            description: task.description.clone(),
            requirements: task.requirements.clone(),
            priority: task.priority,
            attempt: task.attempts + 1,
        };
        let envelope = Envelope::new(&self.sender_id, agent_id, MessageType::TaskRequest, &request)?
            .with_priority(task.priority.weight());
        let delivery_id = envelope.id;

        self.registry.inc_load(agent_id)?;
        if let Err(e) = task.start(agent_id, delivery_id) {
            self.registry.dec_load(agent_id);
            return Err(e);
        }

        if let Err(e) = self.transport.publish(envelope.clone()).await {
            self.registry.dec_load(agent_id);
            let failure = ConvoyError::DispatchFailure(e.to_string());
            warn!(task_id = %task.id, agent_id = %agent_id, error = %e, "Dispatch failed");
            task.fail(failure.to_string())?;
            self.record(&envelope, AuditOutcome::Error, failure.to_string());
            self.store.save_task(task).await?;
            return Err(failure);
        }
        self.record(&envelope, AuditOutcome::Success, String::new());

        let seconds = self.deadline_secs(task);
        self.timeouts
            .watch(task.id, task.attempts, seconds, Duration::from_secs(seconds));
        info!(
            task_id = %task.id,
            agent_id = %agent_id,
            attempt = task.attempts,
            deadline_secs = seconds,
            "Task dispatched"
        );
        self.store.save_task(task).await?;
        Ok(delivery_id)
    }

    fn record(&self, envelope: &Envelope, outcome: AuditOutcome, error: String) {
        self.audit.log(AuditEntry {
            timestamp: envelope.timestamp,
            actor: self.sender_id.clone(),
            action: "message_sent".into(),
            subject: Some(envelope.recipient.clone()),
            message_id: Some(envelope.id),
            details: serde_json::json!({
                "message_type": envelope.message_type,
                "payload": envelope.payload,
                "error": (!error.is_empty()).then_some(error),
            }),
            outcome,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::InProcessBus;
    use convoy_core::{AgentInfo, TaskPriority};
    use convoy_store::MemoryTaskStore;

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<AgentRegistry>,
        bus: Arc<InProcessBus>,
        store: Arc<MemoryTaskStore>,
        timeouts: Arc<TimeoutMonitor>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(AgentRegistry::new());
        registry.register("collector-1", AgentInfo::new("collector", ["fetch"]));
        let bus = Arc::new(InProcessBus::new());
        let store = Arc::new(MemoryTaskStore::new());
        let (timeouts, _rx) = TimeoutMonitor::new();
        let timeouts = Arc::new(timeouts);
        let dispatcher = Dispatcher::new(
            "supervisor",
            300,
            4,
            registry.clone(),
            bus.clone(),
            store.clone(),
            timeouts.clone(),
            Arc::new(AuditLog::in_memory(64)),
        );
        Fixture {
            dispatcher,
            registry,
            bus,
            store,
            timeouts,
        }
    }

    #[tokio::test]
    async fn test_dispatch_marks_in_progress_and_sends() {
        let f = fixture();
        let mut inbox = f.bus.subscribe("collector-1");
        let mut task = Task::new("fetch", "").with_priority(TaskPriority::Critical);

        let delivery = f.dispatcher.dispatch(&mut task, "collector-1").await.unwrap();

        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent.as_deref(), Some("collector-1"));
        assert_eq!(task.delivery_id, Some(delivery));
        assert_eq!(f.registry.get("collector-1").unwrap().load, 1);
        assert!(f.timeouts.is_watching(task.id));

        let envelope = inbox.recv().await.unwrap();
        assert_eq!(envelope.id, delivery);
        assert_eq!(envelope.priority, 10);
        let request: TaskRequest = envelope.decode().unwrap();
        assert_eq!(request.attempt, 1);

        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_send_failure_fails_task_and_restores_load() {
        let f = fixture();
        let mut task = Task::new("fetch", "");

        let err = f
            .dispatcher
            .dispatch(&mut task, "collector-1")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "dispatch_failure");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().starts_with("dispatch failed"));
        assert_eq!(f.registry.get("collector-1").unwrap().load, 0);
        assert!(!f.timeouts.is_watching(task.id));
        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_dispatch_requires_pending() {
        let f = fixture();
        let _inbox = f.bus.subscribe("collector-1");
        let mut task = Task::new("fetch", "");
        f.dispatcher.dispatch(&mut task, "collector-1").await.unwrap();

        let err = f
            .dispatcher
            .dispatch(&mut task, "collector-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(f.registry.get("collector-1").unwrap().load, 1);
    }
}
