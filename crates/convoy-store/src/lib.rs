//! Persistence for the Convoy orchestrator.
//!
//! The [`TaskStore`] trait is the source of truth for tasks and workflows;
//! in-memory maps kept by the orchestrator are caches that can be rebuilt
//! from it. Two implementations are provided, plus the [`AuditLog`].

pub mod audit;
pub mod file;
pub mod memory;
pub mod store;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use file::FileTaskStore;
pub use memory::MemoryTaskStore;
pub use store::{TaskQuery, TaskStore, WorkflowQuery};
