use crate::active::{ActiveTasks, ActiveWorkflows, TaskSlot};
use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::health::HealthMonitor;
use crate::quality;
use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;
use crate::timeout::{TimeoutFired, TimeoutMonitor};
use crate::transport::Transport;
use crate::types::{RecoveryReport, StepReport, SystemStats, TaskSpec, WorkflowReport, WorkflowSpec};
use chrono::Utc;
use convoy_core::{
    AgentInfo, AgentRecord, AgentStatus, ConvoyError, ConvoyResult, Envelope, ErrorReport,
    MessageType, ResponseStatus, StatusUpdate, Task, TaskResponse, TaskStatus, TaskSubmission,
    Workflow, WorkflowStatus,
};
use convoy_store::{AuditEntry, AuditLog, AuditOutcome, TaskQuery, TaskStore, WorkflowQuery};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Stand-in deadline for waits too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Background units started by [`Supervisor::start`].
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every background unit.
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: OrchestratorConfig,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) scheduler: Scheduler,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) timeouts: Arc<TimeoutMonitor>,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) tasks: ActiveTasks,
    pub(crate) workflows: ActiveWorkflows,
    timeout_rx: Mutex<Option<mpsc::UnboundedReceiver<TimeoutFired>>>,
}

/// The orchestrator's public face.
///
/// Composes the registry, scheduler, dispatcher, timeout and health
/// monitors and the workflow executor over a shared [`TaskStore`]. Cheap to
/// clone; clones share all state. Every asynchronous unit (one per dispatch,
/// one per workflow, one per recurring monitor) runs on its own Tokio task.
#[derive(Clone)]
pub struct Supervisor {
    pub(crate) inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn Transport>,
        audit: Arc<AuditLog>,
    ) -> ConvoyResult<Self> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::new());
        let (timeouts, timeout_rx) = TimeoutMonitor::new();
        let timeouts = Arc::new(timeouts);
        let scheduler = Scheduler::new(
            registry.clone(),
            config.assignment_strategy,
            config.random_seed,
        );
        let dispatcher = Dispatcher::new(
            config.supervisor_id.clone(),
            config.default_task_timeout_secs,
            config.max_concurrent_dispatch,
            registry.clone(),
            transport.clone(),
            store.clone(),
            timeouts.clone(),
            audit.clone(),
        );
        let health = Arc::new(HealthMonitor::new(
            config.supervisor_id.clone(),
            config.health_interval(),
            config.health_grace(),
            registry.clone(),
            transport.clone(),
            audit.clone(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                transport,
                audit,
                registry,
                scheduler,
                dispatcher,
                timeouts,
                health,
                tasks: ActiveTasks::new(),
                workflows: ActiveWorkflows::new(),
                timeout_rx: Mutex::new(Some(timeout_rx)),
            }),
        })
    }

    /// Address the supervisor receives messages on.
    pub fn id(&self) -> &str {
        &self.inner.config.supervisor_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.inner.health
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.inner.audit
    }

    /// Spawn the inbound message loop, the timeout handler, the health
    /// monitor and the cache sweep. Can only be called once.
    pub fn start(
        &self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> ConvoyResult<BackgroundTasks> {
        let mut timeout_rx = self
            .inner
            .timeout_rx
            .lock()
            .take()
            .ok_or_else(|| ConvoyError::Config("supervisor already started".into()))?;

        let mut handles = Vec::with_capacity(4);

        let sup = self.clone();
        handles.push(tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                let sup = sup.clone();
                tokio::spawn(async move { sup.handle_envelope(envelope).await });
            }
            info!("Inbound channel closed");
        }));

        let sup = self.clone();
        handles.push(tokio::spawn(async move {
            while let Some(fired) = timeout_rx.recv().await {
                if let Err(e) = sup.on_timeout(fired).await {
                    error!(task_id = %fired.task_id, error = %e, "Timeout handling failed");
                }
            }
        }));

        handles.push(Arc::clone(&self.inner.health).spawn());

        let sup = self.clone();
        let every = self.inner.config.cleanup_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sup.sweep();
            }
        }));

        info!(supervisor_id = %self.id(), strategy = ?self.inner.scheduler.strategy(), "Supervisor started");
        Ok(BackgroundTasks { handles })
    }

    /// Rebuild in-flight state from the store after a restart.
    ///
    /// PENDING tasks are scheduled again, IN_PROGRESS tasks get a deadline
    /// for whatever is left of their timeout, and unfinished workflows resume
    /// from their recorded step -> task map.
    pub async fn recover(&self) -> ConvoyResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for task in self.inner.store.unfinished_tasks().await? {
            let id = task.id;
            match task.status {
                TaskStatus::Pending => {
                    self.inner.tasks.insert(task);
                    self.spawn_schedule(id, Duration::ZERO);
                    report.tasks_requeued += 1;
                }
                TaskStatus::InProgress => {
                    let seconds = self.inner.dispatcher.deadline_secs(&task);
                    let elapsed = task
                        .started_at
                        .and_then(|s| (Utc::now() - s).to_std().ok())
                        .unwrap_or_default();
                    let remaining = Duration::from_secs(seconds).saturating_sub(elapsed);
                    if let Some(agent_id) = task.assigned_agent.as_deref() {
                        if let Err(e) = self.inner.registry.inc_load(agent_id) {
                            warn!(task_id = %id, agent_id = %agent_id, error = %e, "Recovered task's agent is not registered");
                        }
                    }
                    self.inner.timeouts.watch(id, task.attempts, seconds, remaining);
                    self.inner.tasks.insert(task);
                    report.tasks_watched += 1;
                }
                _ => {}
            }
        }
        for workflow in self.inner.store.unfinished_workflows().await? {
            self.inner.workflows.upsert(&workflow);
            self.spawn_workflow(workflow.id);
            report.workflows_resumed += 1;
        }
        info!(
            tasks_requeued = report.tasks_requeued,
            tasks_watched = report.tasks_watched,
            workflows_resumed = report.workflows_resumed,
            "Recovered state from store"
        );
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Agents
    // ---------------------------------------------------------------------

    pub fn register_agent(&self, agent_id: &str, info: AgentInfo) -> AgentRecord {
        let record = self.inner.registry.register(agent_id, info);
        self.inner.audit.log_action(
            agent_id,
            "agent_registered",
            Some(agent_id.to_string()),
            serde_json::json!({
                "type": record.agent_type,
                "capabilities": record.capabilities,
                "status": record.status,
            }),
            AuditOutcome::Success,
        );
        record
    }

    pub fn list_agents(&self) -> Vec<AgentRecord> {
        self.inner.registry.list()
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    /// Persist a new task and schedule it. Scheduling happens in the
    /// background; a task nobody can serve ends up FAILED.
    pub async fn create_task(&self, spec: TaskSpec) -> ConvoyResult<Uuid> {
        let mut task = Task::new(spec.task_type, spec.description)
            .with_priority(spec.priority)
            .with_requirements(spec.requirements)
            .with_max_retries(
                spec.max_retries
                    .unwrap_or(self.inner.config.default_max_retries),
            );
        if let Some(seconds) = spec.timeout_secs {
            task = task.with_timeout(seconds);
        }
        self.submit(task).await
    }

    /// Current state of a task.
    pub async fn task(&self, task_id: Uuid) -> ConvoyResult<Task> {
        if let Some(slot) = self.inner.tasks.get(task_id) {
            return Ok(slot.lock().await.clone());
        }
        self.inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(ConvoyError::TaskNotFound(task_id))
    }

    /// Cancel a PENDING or IN_PROGRESS task.
    pub async fn cancel_task(&self, task_id: Uuid) -> ConvoyResult<Task> {
        let slot = self.slot(task_id).await?;
        let mut task = slot.lock().await;
        let running_on = match task.status {
            TaskStatus::InProgress => task.assigned_agent.clone(),
            _ => None,
        };
        task.cancel()?;
        self.inner.timeouts.cancel(task_id);
        if let Some(agent_id) = running_on.as_deref() {
            self.inner.registry.dec_load(agent_id);
        }
        self.inner.store.save_task(&task).await?;
        info!(task_id = %task_id, "Task cancelled");
        self.audit_task(&task, "task_cancelled", AuditOutcome::Success);
        Ok(task.clone())
    }

    /// Poll until the task is terminal or `timeout` elapses; returns the
    /// latest state either way.
    pub async fn wait_for_task(&self, task_id: Uuid, timeout: Duration) -> ConvoyResult<Task> {
        let deadline = deadline_after(timeout);
        loop {
            let task = self.task(task_id).await?;
            if task.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(task);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    // ---------------------------------------------------------------------
    // Workflows
    // ---------------------------------------------------------------------

    /// Validate and persist a workflow, then start its executor.
    pub async fn create_workflow(&self, spec: WorkflowSpec) -> ConvoyResult<Uuid> {
        let workflow = Workflow::new(spec.name, spec.description, spec.steps);
        workflow.validate()?;
        self.save_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, steps = workflow.steps.len(), "Workflow created");
        self.inner.audit.log_action(
            self.id(),
            "workflow_created",
            Some(workflow.id.to_string()),
            serde_json::json!({ "name": workflow.name, "steps": workflow.steps.len() }),
            AuditOutcome::Success,
        );
        self.spawn_workflow(workflow.id);
        Ok(workflow.id)
    }

    /// Progress report for a workflow.
    pub async fn workflow(&self, workflow_id: Uuid) -> ConvoyResult<WorkflowReport> {
        let workflow = self.load_workflow(workflow_id).await?;
        let mut steps = Vec::with_capacity(workflow.steps.len());
        for step in &workflow.steps {
            let task_id = workflow.step_tasks.get(&step.id).copied();
            let task = match task_id {
                Some(id) => self.task(id).await.ok(),
                None => None,
            };
            steps.push(StepReport {
                step_id: step.id.clone(),
                task_id,
                status: task.as_ref().map(|t| t.status),
                error_message: task.and_then(|t| t.error_message),
            });
        }
        let completed_steps = steps
            .iter()
            .filter(|s| s.status == Some(TaskStatus::Completed))
            .count();
        Ok(WorkflowReport {
            workflow_id: workflow.id,
            name: workflow.name,
            status: workflow.status,
            steps,
            completed_steps,
            error_message: workflow.error_message,
        })
    }

    /// Stop a workflow's executor, cancel its unfinished step tasks and mark
    /// it CANCELLED.
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> ConvoyResult<WorkflowReport> {
        if let Some(handle) = self.inner.workflows.take_executor(workflow_id) {
            handle.abort();
            let _ = handle.await;
        }
        let mut workflow = self.load_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Err(ConvoyError::InvalidTransition {
                from: workflow.status.to_string(),
                to: WorkflowStatus::Cancelled.to_string(),
            });
        }
        for task_id in workflow.step_tasks.values().copied().collect::<Vec<_>>() {
            match self.cancel_task(task_id).await {
                Ok(_) | Err(ConvoyError::InvalidTransition { .. }) => {}
                Err(e) => warn!(workflow_id = %workflow_id, task_id = %task_id, error = %e, "Could not cancel step task"),
            }
        }
        workflow.set_status(WorkflowStatus::Cancelled);
        self.save_workflow(&workflow).await?;
        info!(workflow_id = %workflow_id, "Workflow cancelled");
        self.inner.audit.log_action(
            self.id(),
            "workflow_cancelled",
            Some(workflow_id.to_string()),
            serde_json::json!({ "name": workflow.name }),
            AuditOutcome::Success,
        );
        self.workflow(workflow_id).await
    }

    /// Poll until the workflow is terminal or `timeout` elapses.
    pub async fn wait_for_workflow(
        &self,
        workflow_id: Uuid,
        timeout: Duration,
    ) -> ConvoyResult<WorkflowReport> {
        let deadline = deadline_after(timeout);
        loop {
            let report = self.workflow(workflow_id).await?;
            if report.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(report);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    // ---------------------------------------------------------------------
    // Statistics and housekeeping
    // ---------------------------------------------------------------------

    pub async fn stats(&self) -> ConvoyResult<SystemStats> {
        let agents = self.inner.registry.list();
        let ready_agents = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Ready)
            .count();
        let store = &self.inner.store;
        let active_workflows = store
            .find_workflows(&WorkflowQuery::all().status(WorkflowStatus::Pending))
            .await?
            .len()
            + store
                .find_workflows(&WorkflowQuery::all().status(WorkflowStatus::InProgress))
                .await?
                .len();

        let system_health = if agents.is_empty() {
            0.0
        } else {
            let mut score = ready_agents as f64 / agents.len() as f64;
            let since = Utc::now() - chrono::Duration::hours(1);
            let recent = store
                .find_tasks(&TaskQuery::all().created_after(since))
                .await?;
            if !recent.is_empty() {
                let completed = recent
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed)
                    .count();
                score = (score + completed as f64 / recent.len() as f64) / 2.0;
            }
            (score * 100.0).round() / 100.0
        };

        Ok(SystemStats {
            total_agents: agents.len(),
            ready_agents,
            total_tasks: store.count_tasks(None).await?,
            completed_tasks: store.count_tasks(Some(TaskStatus::Completed)).await?,
            failed_tasks: store.count_tasks(Some(TaskStatus::Failed)).await?,
            active_workflows,
            system_health,
        })
    }

    /// Evict terminal tasks and workflows from the in-memory caches. The
    /// store keeps them. Returns `(tasks, workflows)` evicted.
    pub fn sweep(&self) -> (usize, usize) {
        let tasks = self.inner.tasks.evict_terminal();
        let workflows = self.inner.workflows.evict_terminal();
        if tasks + workflows > 0 {
            debug!(tasks, workflows, "Evicted finished entries from cache");
        }
        (tasks, workflows)
    }

    /// Number of tasks currently cached.
    pub fn cached_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    // ---------------------------------------------------------------------
    // Inbound messages
    // ---------------------------------------------------------------------

    /// Process one inbound envelope. Handler errors are logged and answered
    /// with an `error_report` to the sender; they never propagate.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        self.inner.registry.touch(&envelope.sender, Utc::now());
        self.record_message("message_received", &envelope, AuditOutcome::Success);

        let result = match envelope.message_type {
            MessageType::TaskResponse => self.on_task_response(&envelope).await,
            MessageType::StatusUpdate => self.on_status_update(&envelope),
            MessageType::ErrorReport => self.on_error_report(&envelope),
            MessageType::TaskRequest => self.on_task_submission(&envelope).await,
            MessageType::HealthCheck => self.on_health_check(&envelope).await,
        };

        if let Err(e) = result {
            error!(
                message_id = %envelope.id,
                sender = %envelope.sender,
                message_type = %envelope.message_type,
                error = %e,
                "Message handler failed"
            );
            self.report_error(&envelope, &e).await;
        }
    }

    async fn on_task_response(&self, envelope: &Envelope) -> ConvoyResult<()> {
        let response: TaskResponse = envelope.decode()?;
        let failure = match response.status {
            ResponseStatus::Accepted => {
                debug!(task_id = %response.task_id, "Task request acknowledged");
                return Ok(());
            }
            ResponseStatus::Completed => None,
            ResponseStatus::Failed => Some(ConvoyError::AgentReportedFailure(
                response
                    .error
                    .clone()
                    .unwrap_or_else(|| "no reason given".to_string()),
            )),
        };

        let slot = self.slot(response.task_id).await?;
        let mut task = slot.lock().await;
        if task.status != TaskStatus::InProgress
            || envelope.correlation_id.is_none()
            || envelope.correlation_id != task.delivery_id
        {
            warn!(
                task_id = %task.id,
                status = %task.status,
                sender = %envelope.sender,
                "Ignoring stale task response"
            );
            return Ok(());
        }

        self.inner.timeouts.cancel(task.id);
        if let Some(agent_id) = task.assigned_agent.clone() {
            self.inner.registry.dec_load(&agent_id);
        }

        match failure {
            None => {
                task.complete(response.result)?;
                if let Err(e) = quality::assess(&task, &self.inner.config.quality) {
                    warn!(task_id = %task.id, error = %e, "Result accepted below quality threshold");
                    self.audit_task(&task, "quality_rejected", AuditOutcome::Rejected);
                }
                self.inner.store.save_task(&task).await?;
                info!(
                    task_id = %task.id,
                    agent_id = ?task.assigned_agent,
                    attempts = task.attempts,
                    "Task completed"
                );
                self.audit_task(&task, "task_completed", AuditOutcome::Success);
            }
            Some(err) => {
                task.fail(err.to_string())?;
                self.handle_failure(&mut task, err).await?;
            }
        }
        Ok(())
    }

    fn on_status_update(&self, envelope: &Envelope) -> ConvoyResult<()> {
        let update: StatusUpdate = envelope.decode()?;
        self.inner
            .registry
            .update_status(&update.agent_id, update.status, Utc::now())?;
        debug!(
            agent_id = %update.agent_id,
            status = %update.status,
            active_tasks = update.active_tasks,
            "Agent status updated"
        );
        Ok(())
    }

    fn on_error_report(&self, envelope: &Envelope) -> ConvoyResult<()> {
        let report: ErrorReport = envelope.decode()?;
        warn!(
            sender = %envelope.sender,
            original_message_id = %report.original_message_id,
            error = %report.error,
            "Agent reported an error"
        );
        self.inner.audit.log_action(
            &envelope.sender,
            "error_reported",
            Some(report.original_message_id.to_string()),
            serde_json::json!({ "error": report.error }),
            AuditOutcome::Error,
        );
        Ok(())
    }

    async fn on_task_submission(&self, envelope: &Envelope) -> ConvoyResult<()> {
        let submission: TaskSubmission = envelope.decode()?;
        let task_id = self
            .create_task(TaskSpec {
                task_type: submission.task_type,
                description: submission.description,
                priority: submission.priority,
                requirements: submission.requirements,
                max_retries: None,
                timeout_secs: None,
            })
            .await?;
        let reply = envelope.reply(
            self.id(),
            MessageType::TaskResponse,
            &TaskResponse::accepted(task_id),
        )?;
        self.send(reply).await
    }

    async fn on_health_check(&self, envelope: &Envelope) -> ConvoyResult<()> {
        let update = StatusUpdate {
            agent_id: self.id().to_string(),
            status: AgentStatus::Ready,
            active_tasks: self.inner.tasks.in_progress(),
        };
        let reply = envelope.reply(self.id(), MessageType::StatusUpdate, &update)?;
        self.send(reply).await
    }

    async fn report_error(&self, envelope: &Envelope, err: &ConvoyError) {
        if envelope.sender == self.id() {
            return;
        }
        let report = ErrorReport {
            original_message_id: envelope.id,
            error: err.to_string(),
            timestamp: Utc::now(),
        };
        let sent = match envelope.reply(self.id(), MessageType::ErrorReport, &report) {
            Ok(reply) => self.send(reply).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(recipient = %envelope.sender, error = %e, "Could not send error report");
        }
    }

    async fn send(&self, envelope: Envelope) -> ConvoyResult<()> {
        match self.inner.transport.publish(envelope.clone()).await {
            Ok(()) => {
                self.record_message("message_sent", &envelope, AuditOutcome::Success);
                Ok(())
            }
            Err(e) => {
                self.record_message("message_sent", &envelope, AuditOutcome::Error);
                Err(e)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Scheduling, failures and timeouts
    // ---------------------------------------------------------------------

    /// Persist, cache and schedule a new task.
    pub(crate) async fn submit(&self, task: Task) -> ConvoyResult<Uuid> {
        self.inner.store.save_task(&task).await?;
        let task_id = task.id;
        info!(
            task_id = %task_id,
            task_type = %task.task_type,
            priority = ?task.priority,
            workflow_id = ?task.workflow_id,
            "Task created"
        );
        self.audit_task(&task, "task_created", AuditOutcome::Success);
        self.inner.tasks.insert(task);
        self.spawn_schedule(task_id, Duration::ZERO);
        Ok(task_id)
    }

    fn spawn_schedule(&self, task_id: Uuid, delay: Duration) {
        let sup = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = sup.schedule(task_id).await {
                error!(task_id = %task_id, error = %e, "Scheduling failed");
            }
        });
    }

    /// Select an agent for a PENDING task and dispatch it. Anything else is
    /// left alone, which makes a deferred retry of a cancelled task a no-op.
    async fn schedule(&self, task_id: Uuid) -> ConvoyResult<()> {
        let slot = self.slot(task_id).await?;
        let mut task = slot.lock().await;
        if task.status != TaskStatus::Pending {
            debug!(task_id = %task_id, status = %task.status, "Skipping schedule of non-pending task");
            return Ok(());
        }

        let Some(agent_id) = self.inner.scheduler.select_agent(&task) else {
            let err = ConvoyError::NoEligibleAgent {
                task_type: task.task_type.clone(),
            };
            task.fail(err.to_string())?;
            return self.handle_failure(&mut task, err).await;
        };

        match self.inner.dispatcher.dispatch(&mut task, &agent_id).await {
            Ok(_) => Ok(()),
            Err(err @ ConvoyError::DispatchFailure(_)) => self.handle_failure(&mut task, err).await,
            // Agent vanished between selection and hand-off.
            Err(e) if task.status == TaskStatus::Pending => {
                let err = ConvoyError::DispatchFailure(e.to_string());
                task.fail(err.to_string())?;
                self.handle_failure(&mut task, err).await
            }
            Err(e) => Err(e),
        }
    }

    /// Decide what happens to a task that just moved to FAILED. Runs under
    /// the task's lock, so the retry reset is never observed half-done.
    async fn handle_failure(&self, task: &mut Task, error: ConvoyError) -> ConvoyResult<()> {
        let retryable = match &error {
            ConvoyError::Timeout { .. } => self.inner.config.retry_timeouts,
            other => other.is_retryable(),
        };

        if retryable && task.has_retry_budget() {
            task.reset_for_retry()?;
            let delay = self.inner.config.backoff(task.retry_count);
            // A lost write is repaired when dispatch persists the task.
            if let Err(e) = self.inner.store.save_task(task).await {
                error!(task_id = %task.id, error = %e, "Could not persist retry reset");
            }
            info!(
                task_id = %task.id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying task after backoff"
            );
            self.spawn_schedule(task.id, delay);
        } else {
            self.inner.store.save_task(task).await?;
            warn!(
                task_id = %task.id,
                kind = error.kind(),
                retry_count = task.retry_count,
                error = %error,
                "Task failed"
            );
            self.audit_task(task, "task_failed", AuditOutcome::Error);
        }
        Ok(())
    }

    async fn on_timeout(&self, fired: TimeoutFired) -> ConvoyResult<()> {
        let slot = self.slot(fired.task_id).await?;
        let mut task = slot.lock().await;
        if task.status != TaskStatus::InProgress || task.attempts != fired.attempt {
            debug!(task_id = %task.id, attempt = fired.attempt, "Ignoring stale deadline");
            return Ok(());
        }
        if let Some(agent_id) = task.assigned_agent.clone() {
            self.inner.registry.dec_load(&agent_id);
        }
        let err = ConvoyError::Timeout {
            seconds: fired.seconds,
        };
        warn!(task_id = %task.id, agent_id = ?task.assigned_agent, seconds = fired.seconds, "Task timed out");
        task.fail(err.to_string())?;
        self.handle_failure(&mut task, err).await
    }

    // ---------------------------------------------------------------------
    // Cache access
    // ---------------------------------------------------------------------

    /// The task's slot, loading it from the store on a cache miss.
    async fn slot(&self, task_id: Uuid) -> ConvoyResult<TaskSlot> {
        if let Some(slot) = self.inner.tasks.get(task_id) {
            return Ok(slot);
        }
        let task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(ConvoyError::TaskNotFound(task_id))?;
        Ok(self.inner.tasks.insert(task))
    }

    pub(crate) async fn load_workflow(&self, workflow_id: Uuid) -> ConvoyResult<Workflow> {
        if let Some(workflow) = self.inner.workflows.get(workflow_id) {
            return Ok(workflow);
        }
        self.inner
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(ConvoyError::WorkflowNotFound(workflow_id))
    }

    pub(crate) async fn save_workflow(&self, workflow: &Workflow) -> ConvoyResult<()> {
        self.inner.store.save_workflow(workflow).await?;
        self.inner.workflows.upsert(workflow);
        Ok(())
    }

    fn spawn_workflow(&self, workflow_id: Uuid) {
        let sup = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = sup.execute_workflow(workflow_id).await {
                error!(workflow_id = %workflow_id, error = %e, "Workflow executor failed");
                if let Ok(mut workflow) = sup.load_workflow(workflow_id).await {
                    if !workflow.status.is_terminal() {
                        let _ = sup
                            .finish_workflow(&mut workflow, WorkflowStatus::Failed, Some(e.to_string()))
                            .await;
                    }
                }
            }
        });
        self.inner.workflows.set_executor(workflow_id, handle);
    }

    // ---------------------------------------------------------------------
    // Audit helpers
    // ---------------------------------------------------------------------

    fn audit_task(&self, task: &Task, action: &str, outcome: AuditOutcome) {
        self.inner.audit.log_action(
            self.id(),
            action,
            Some(task.id.to_string()),
            serde_json::json!({
                "type": task.task_type,
                "status": task.status,
                "agent_id": task.assigned_agent,
                "retry_count": task.retry_count,
                "error": task.error_message,
                "workflow_id": task.workflow_id,
                "step_id": task.step_id,
            }),
            outcome,
        );
    }

    fn record_message(&self, action: &str, envelope: &Envelope, outcome: AuditOutcome) {
        self.inner.audit.log(AuditEntry {
            timestamp: Utc::now(),
            actor: envelope.sender.clone(),
            action: action.to_string(),
            subject: Some(envelope.recipient.clone()),
            message_id: Some(envelope.id),
            details: serde_json::json!({
                "message_type": envelope.message_type,
                "correlation_id": envelope.correlation_id,
                "payload": envelope.payload,
            }),
            outcome,
        });
    }
}
