use crate::supervisor::Supervisor;
use convoy_core::{
    ConvoyError, ConvoyResult, Task, TaskStatus, Workflow, WorkflowStatus, WorkflowStep,
};
use convoy_store::AuditOutcome;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executor bookkeeping: steps done and steps with a task in flight.
#[derive(Debug, Clone, Default)]
pub struct StepProgress {
    pub completed: HashSet<String>,
    /// Step id -> task id.
    pub running: HashMap<String, Uuid>,
}

impl StepProgress {
    /// Pick up from a workflow's persisted step -> task map. Every recorded
    /// task starts out as running; the first poll sorts out which finished.
    pub fn resume(workflow: &Workflow) -> Self {
        Self {
            completed: HashSet::new(),
            running: workflow.step_tasks.clone(),
        }
    }

    /// Steps neither completed nor running whose dependencies are all
    /// completed, in declaration order.
    pub fn ready<'a>(&self, steps: &'a [WorkflowStep]) -> Vec<&'a WorkflowStep> {
        steps
            .iter()
            .filter(|s| !self.completed.contains(&s.id) && !self.running.contains_key(&s.id))
            .filter(|s| s.is_ready(&self.completed))
            .collect()
    }

    pub fn is_done(&self, steps: &[WorkflowStep]) -> bool {
        steps.iter().all(|s| self.completed.contains(&s.id))
    }

    /// Nothing runs, nothing can start, and work remains: the remaining
    /// steps wait on each other.
    pub fn is_stalled(&self, steps: &[WorkflowStep]) -> bool {
        !self.is_done(steps) && self.running.is_empty() && self.ready(steps).is_empty()
    }

    /// Ids of steps that are neither completed nor running.
    pub fn blocked<'a>(&self, steps: &'a [WorkflowStep]) -> Vec<&'a str> {
        steps
            .iter()
            .filter(|s| !self.completed.contains(&s.id) && !self.running.contains_key(&s.id))
            .map(|s| s.id.as_str())
            .collect()
    }

    pub fn mark_completed(&mut self, step_id: &str) {
        self.running.remove(step_id);
        self.completed.insert(step_id.to_string());
    }
}

impl Supervisor {
    /// Drive a workflow to a terminal status.
    ///
    /// Each pass polls the running step tasks, then creates tasks for every
    /// step whose dependencies are complete. The first failed or cancelled
    /// step fails the workflow; steps depending on it are never created.
    pub(crate) async fn execute_workflow(&self, workflow_id: Uuid) -> ConvoyResult<()> {
        let mut workflow = self.load_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(());
        }
        if workflow.status == WorkflowStatus::Pending {
            workflow.set_status(WorkflowStatus::InProgress);
            self.save_workflow(&workflow).await?;
        }
        info!(workflow_id = %workflow.id, name = %workflow.name, steps = workflow.steps.len(), "Workflow started");

        let mut progress = StepProgress::resume(&workflow);
        loop {
            let mut advanced = false;

            let running: Vec<(String, Uuid)> = progress
                .running
                .iter()
                .map(|(step, task)| (step.clone(), *task))
                .collect();
            for (step_id, task_id) in running {
                let task = match self.task(task_id).await {
                    Ok(task) => task,
                    // Recorded, but the process stopped before the task was
                    // persisted. The step becomes ready again.
                    Err(ConvoyError::TaskNotFound(_)) => {
                        warn!(workflow_id = %workflow.id, step_id = %step_id, task_id = %task_id, "Step task was never persisted");
                        progress.running.remove(&step_id);
                        workflow.step_tasks.remove(&step_id);
                        advanced = true;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                match task.status {
                    TaskStatus::Completed => {
                        debug!(workflow_id = %workflow.id, step_id = %step_id, "Step completed");
                        progress.mark_completed(&step_id);
                        advanced = true;
                    }
                    TaskStatus::Failed | TaskStatus::Cancelled => {
                        let reason = format!(
                            "step '{step_id}' {}: {}",
                            task.status,
                            task.error_message.as_deref().unwrap_or("no error recorded")
                        );
                        return self
                            .finish_workflow(&mut workflow, WorkflowStatus::Failed, Some(reason))
                            .await;
                    }
                    TaskStatus::Pending | TaskStatus::InProgress => {}
                }
            }

            if progress.is_done(&workflow.steps) {
                return self
                    .finish_workflow(&mut workflow, WorkflowStatus::Completed, None)
                    .await;
            }

            if progress.is_stalled(&workflow.steps) {
                let err = ConvoyError::CircularDependency(format!(
                    "steps [{}] can never become ready",
                    progress.blocked(&workflow.steps).join(", ")
                ));
                error!(workflow_id = %workflow.id, error = %err, "Workflow cannot make progress");
                return self
                    .finish_workflow(&mut workflow, WorkflowStatus::Failed, Some(err.to_string()))
                    .await;
            }

            let ready: Vec<WorkflowStep> = progress
                .ready(&workflow.steps)
                .into_iter()
                .cloned()
                .collect();
            for step in &ready {
                let task = Task::new(
                    step.task_type.clone(),
                    format!("{} / {}", workflow.name, step.id),
                )
                .with_requirements(step.parameters.clone())
                .with_timeout(step.timeout)
                .with_agent_type(step.agent_type.clone())
                .with_max_retries(self.inner.config.default_max_retries)
                .for_step(workflow.id, step.id.clone());

                // Link first: cancel and recovery only see recorded tasks.
                workflow.step_tasks.insert(step.id.clone(), task.id);
                workflow.updated_at = chrono::Utc::now();
                self.save_workflow(&workflow).await?;
                progress.running.insert(step.id.clone(), task.id);

                let task_id = self.submit(task).await?;
                debug!(workflow_id = %workflow.id, step_id = %step.id, task_id = %task_id, "Step scheduled");
                advanced = true;
            }

            if !advanced {
                tokio::time::sleep(self.inner.config.poll_interval()).await;
            }
        }
    }

    pub(crate) async fn finish_workflow(
        &self,
        workflow: &mut Workflow,
        status: WorkflowStatus,
        error_message: Option<String>,
    ) -> ConvoyResult<()> {
        workflow.set_status(status);
        workflow.error_message = error_message;
        self.save_workflow(workflow).await?;

        let outcome = if status == WorkflowStatus::Completed {
            info!(workflow_id = %workflow.id, name = %workflow.name, "Workflow completed");
            AuditOutcome::Success
        } else {
            warn!(
                workflow_id = %workflow.id,
                status = %status,
                error = workflow.error_message.as_deref().unwrap_or_default(),
                "Workflow did not complete"
            );
            AuditOutcome::Error
        };
        self.inner.audit.log_action(
            &self.inner.config.supervisor_id,
            format!("workflow_{status}"),
            Some(workflow.id.to_string()),
            serde_json::json!({
                "name": workflow.name,
                "error": workflow.error_message,
            }),
            outcome,
        );
        Ok(())
    }
}
