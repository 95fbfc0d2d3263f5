//! TaskMesh Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Persistence
//! - Runtime specifics
//!
//! All types here represent the scheduling domain of TaskMesh: tasks,
//! execution backends, assignments, and admission policy.

pub mod api;
pub mod assignment;
pub mod backend;
pub mod error;
pub mod ids;
pub mod policy;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use assignment::Assignment;
pub use backend::{Backend, BackendInfo};
pub use error::{CoreError, FailureReason, RejectionCode};
pub use ids::{AssignmentSeq, BackendId, CallerId, TaskId};
pub use policy::{CallerClass, Policy, PolicyRule, RateLimit};
pub use status::{BackendHealth, Priority, TaskState};
pub use task::{Task, TaskError, TaskSnapshot, TaskSpec};
