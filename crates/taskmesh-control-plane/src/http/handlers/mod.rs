//! HTTP request handlers.

mod backends;
mod health;
mod tasks;

pub use backends::{
    deregister_backend, drain_assignments, heartbeat, list_backends, register_backend,
    report_outcome,
};
pub use health::{health_check, list_alerts, metrics_handler, reload_config};
pub use tasks::{cancel_task, list_tasks, submit_task, task_status};
