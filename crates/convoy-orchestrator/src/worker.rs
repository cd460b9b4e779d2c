use crate::transport::Transport;
use async_trait::async_trait;
use convoy_core::{
    AgentInfo, AgentStatus, ConvoyResult, Envelope, MessageType, Payload, StatusUpdate,
    TaskRequest, TaskResponse,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Something that can execute tasks of the types it advertises.
///
/// The orchestrator never sees concrete workers; it only knows the
/// capability set an agent registered with.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Task types this worker can serve.
    fn capabilities(&self) -> Vec<String>;

    fn accepts(&self, task_type: &str) -> bool {
        self.capabilities().iter().any(|c| c == task_type)
    }

    /// Execute one request. `Err` carries the failure reason reported back.
    async fn handle(&self, request: &TaskRequest) -> Result<Payload, String>;
}

/// Serves a [`Worker`] over a [`Transport`] under a fixed agent id.
///
/// Answers `task_request` with a correlated `task_response` and
/// `health_check` with a `status_update`. Requests run concurrently.
pub struct WorkerHost {
    agent_id: String,
    agent_type: String,
    worker: Arc<dyn Worker>,
    transport: Arc<dyn Transport>,
    active: AtomicU32,
}

impl WorkerHost {
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        worker: Arc<dyn Worker>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            worker,
            transport,
            active: AtomicU32::new(0),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Registration info for this host's worker.
    pub fn info(&self) -> AgentInfo {
        AgentInfo::new(self.agent_type.clone(), self.worker.capabilities())
    }

    /// Consume `inbox` on a background task until the mailbox closes.
    pub fn spawn(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        let host = self;
        tokio::spawn(async move {
            info!(agent_id = %host.agent_id, "Worker host started");
            while let Some(envelope) = inbox.recv().await {
                match envelope.message_type {
                    MessageType::TaskRequest => {
                        let host = Arc::clone(&host);
                        tokio::spawn(async move {
                            if let Err(e) = host.run_request(envelope).await {
                                warn!(agent_id = %host.agent_id, error = %e, "Could not answer task request");
                            }
                        });
                    }
                    MessageType::HealthCheck => {
                        if let Err(e) = host.answer_probe(&envelope).await {
                            warn!(agent_id = %host.agent_id, error = %e, "Could not answer health check");
                        }
                    }
                    other => {
                        debug!(agent_id = %host.agent_id, message_type = %other, "Ignoring message");
                    }
                }
            }
            info!(agent_id = %host.agent_id, "Worker host stopped");
        })
    }

    async fn run_request(&self, envelope: Envelope) -> ConvoyResult<()> {
        let request: TaskRequest = envelope.decode()?;
        let response = if !self.worker.accepts(&request.task_type) {
            TaskResponse::failed(
                request.task_id,
                format!("unsupported task type '{}'", request.task_type),
            )
        } else {
            self.active.fetch_add(1, Ordering::Relaxed);
            let outcome = self.worker.handle(&request).await;
            self.active.fetch_sub(1, Ordering::Relaxed);
            match outcome {
                Ok(result) => TaskResponse::completed(request.task_id, result),
                Err(reason) => TaskResponse::failed(request.task_id, reason),
            }
        };
        let reply = envelope.reply(&self.agent_id, MessageType::TaskResponse, &response)?;
        self.transport.publish(reply).await
    }

    async fn answer_probe(&self, envelope: &Envelope) -> ConvoyResult<()> {
        let update = StatusUpdate {
            agent_id: self.agent_id.clone(),
            status: AgentStatus::Ready,
            active_tasks: self.active.load(Ordering::Relaxed),
        };
        let reply = envelope.reply(&self.agent_id, MessageType::StatusUpdate, &update)?;
        self.transport.publish(reply).await
    }
}

/// Returns the request's requirements as its result, or always fails when
/// built with [`EchoWorker::failing`].
pub struct EchoWorker {
    capabilities: Vec<String>,
    failure: Option<String>,
}

impl EchoWorker {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            failure: None,
        }
    }

    pub fn failing<I, S>(capabilities: I, reason: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failure: Some(reason.into()),
            ..Self::new(capabilities)
        }
    }
}

#[async_trait]
impl Worker for EchoWorker {
    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn handle(&self, request: &TaskRequest) -> Result<Payload, String> {
        if let Some(reason) = &self.failure {
            return Err(reason.clone());
        }
        let mut result = request.requirements.clone();
        result.insert("task_type".into(), request.task_type.clone().into());
        result.insert("attempt".into(), request.attempt.into());
        Ok(result)
    }
}
