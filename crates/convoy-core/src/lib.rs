//! Core types and error definitions for the Convoy orchestrator.
//!
//! This crate holds the data model shared by the store and the orchestrator:
//! tasks and their state machine, workflows and their steps, agent records,
//! and the messaging envelope exchanged with workers.
//!
//! # Main types
//!
//! - [`ConvoyError`]: Unified error enum with stable kind strings.
//! - [`Task`]: A unit of work and its lifecycle ([`TaskStatus`]).
//! - [`Workflow`]: A DAG of [`WorkflowStep`]s executed to a single outcome.
//! - [`AgentRecord`]: Registry entry for a worker and its capabilities.
//! - [`Envelope`]: Message exchanged over the transport, with typed bodies.

/// Agent registration and registry records.
pub mod agent;
/// Error types.
pub mod error;
/// Messaging envelope and typed payloads.
pub mod message;
/// Task data model and state machine.
pub mod task;
/// Workflow data model.
pub mod workflow;

pub use agent::{AgentInfo, AgentRecord, AgentStatus};
pub use error::{ConvoyError, ConvoyResult};
pub use message::{
    Envelope, ErrorReport, HealthCheck, MessageType, ResponseStatus, StatusUpdate, TaskRequest,
    TaskResponse, TaskSubmission,
};
pub use task::{Payload, Task, TaskPriority, TaskStatus};
pub use workflow::{Workflow, WorkflowStatus, WorkflowStep};
