use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`ConvoyError`].
pub type ConvoyResult<T> = Result<T, ConvoyError>;

/// Top-level error type for the Convoy orchestrator.
///
/// The first six variants mirror the failure taxonomy of task execution; the
/// rest cover lookups, validation and infrastructure.
#[derive(Error, Debug)]
pub enum ConvoyError {
    /// No registered agent advertises the capability or is ready to take work.
    #[error("no suitable agent available for task type '{task_type}'")]
    NoEligibleAgent {
        /// The capability that nobody could serve.
        task_type: String,
    },

    /// The transport could not deliver a message to its recipient.
    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    /// The worker explicitly reported that the task failed.
    #[error("agent reported failure: {0}")]
    AgentReportedFailure(String),

    /// No response arrived within the task deadline.
    #[error("Task timed out after {seconds} seconds")]
    Timeout {
        /// The deadline that elapsed.
        seconds: u64,
    },

    /// The workflow step graph has no valid topological order.
    #[error("circular dependency detected in workflow: {0}")]
    CircularDependency(String),

    /// A completed result was accepted but flagged by quality validation.
    #[error("result below quality threshold: {0}")]
    QualityBelowThreshold(String),

    /// The workflow definition is malformed (duplicate or unknown step ids).
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// A state machine transition that is not allowed.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvoyError {
    /// Stable, machine-readable kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvoyError::NoEligibleAgent { .. } => "no_eligible_agent",
            ConvoyError::DispatchFailure(_) => "dispatch_failure",
            ConvoyError::AgentReportedFailure(_) => "agent_reported_failure",
            ConvoyError::Timeout { .. } => "timeout",
            ConvoyError::CircularDependency(_) => "circular_dependency",
            ConvoyError::QualityBelowThreshold(_) => "quality_below_threshold",
            ConvoyError::InvalidWorkflow(_) => "invalid_workflow",
            ConvoyError::InvalidTransition { .. } => "invalid_transition",
            ConvoyError::TaskNotFound(_) => "task_not_found",
            ConvoyError::WorkflowNotFound(_) => "workflow_not_found",
            ConvoyError::AgentNotFound(_) => "agent_not_found",
            ConvoyError::Transport(_) => "transport",
            ConvoyError::Store(_) => "store",
            ConvoyError::Config(_) => "config",
            ConvoyError::Json(_) => "json",
            ConvoyError::Io(_) => "io",
        }
    }

    /// Whether a task that failed with this error may be retried.
    ///
    /// Missing agents and broken workflow graphs are fatal; transport errors,
    /// worker failures and timeouts consume the task's retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConvoyError::DispatchFailure(_)
                | ConvoyError::AgentReportedFailure(_)
                | ConvoyError::Timeout { .. }
                | ConvoyError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_mentions_seconds() {
        let err = ConvoyError::Timeout { seconds: 5 };
        assert_eq!(err.to_string(), "Task timed out after 5 seconds");
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_retry_policy() {
        assert!(ConvoyError::AgentReportedFailure("boom".into()).is_retryable());
        assert!(ConvoyError::DispatchFailure("closed".into()).is_retryable());
        assert!(!ConvoyError::NoEligibleAgent {
            task_type: "fetch".into()
        }
        .is_retryable());
        assert!(!ConvoyError::CircularDependency("a -> b -> a".into()).is_retryable());
        assert!(!ConvoyError::QualityBelowThreshold("low".into()).is_retryable());
    }

    #[test]
    fn test_no_eligible_agent_message() {
        let err = ConvoyError::NoEligibleAgent {
            task_type: "fetch".into(),
        };
        assert!(err.to_string().contains("no suitable agent available"));
        assert_eq!(err.kind(), "no_eligible_agent");
    }
}
