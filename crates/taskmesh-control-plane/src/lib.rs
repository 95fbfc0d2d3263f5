//! TaskMesh Control Plane Library
//!
//! This crate hosts the scheduling pipeline: admission, the backend
//! registry, the scheduler core, dispatch & lifecycle tracking, and the
//! resilience loops, plus configuration and the HTTP surface.

pub mod admission;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod state;

pub use admission::{AdmissionController, Rejection};
pub use config::{Config, ConfigHandle};
pub use dispatch::{BackendExecutor, DispatchAck, LifecycleTracker};
pub use registry::BackendRegistry;
pub use scheduler::Scheduler;
pub use state::AppState;
