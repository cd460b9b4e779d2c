//! Capability-based task orchestration for Convoy.
//!
//! A [`Supervisor`] accepts tasks and DAG workflows, routes each task to a
//! registered agent that advertises the task's type, tracks the delivery
//! until the agent answers or the deadline passes, and retries failures with
//! exponential backoff. Agents are reached through the [`Transport`] seam;
//! [`InProcessBus`] and [`WorkerHost`] run everything inside one process.
//!
//! # Main types
//!
//! - [`Supervisor`]: Façade over the components below; the external contract.
//! - [`AgentRegistry`]: Agents, capabilities, status and in-flight load.
//! - [`Scheduler`]: Picks an eligible agent under an [`AssignmentStrategy`].
//! - [`Dispatcher`]: Sends a task and arms its deadline.
//! - [`TimeoutMonitor`]: Reports deadlines that elapse.
//! - [`HealthMonitor`]: Probes agents and marks silent ones as `error`.
//! - [`Worker`]: Capability interface implemented by task executors.

/// In-memory task and workflow caches.
pub mod active;
/// Orchestrator configuration.
pub mod config;
/// Task dispatch.
pub mod dispatcher;
/// Agent health probing.
pub mod health;
/// Result quality checks.
pub mod quality;
/// Agent registry.
pub mod registry;
/// Agent selection.
pub mod scheduler;
/// Supervisor façade.
pub mod supervisor;
/// Per-task deadlines.
pub mod timeout;
/// Messaging seam and in-process bus.
pub mod transport;
/// Control-surface request and report types.
pub mod types;
/// Worker capability trait and host.
pub mod worker;
/// Workflow step planning and execution.
pub mod workflow;

pub use config::{AssignmentStrategy, OrchestratorConfig, QualityThresholds};
pub use dispatcher::Dispatcher;
pub use health::HealthMonitor;
pub use registry::AgentRegistry;
pub use scheduler::Scheduler;
pub use supervisor::{BackgroundTasks, Supervisor};
pub use timeout::{TimeoutFired, TimeoutMonitor};
pub use transport::{InProcessBus, Transport};
pub use types::{
    RecoveryReport, StepReport, SystemStats, TaskSpec, WorkflowReport, WorkflowSpec,
};
pub use worker::{EchoWorker, Worker, WorkerHost};
pub use workflow::StepProgress;
