//! TaskMesh CLI - Command line interface for the TaskMesh control plane.

mod client;

use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use taskmesh_core::api::{
    AlertResponse, BackendResponse, CancelResponse, StatusResponse, SubmitRequest, SubmitResponse,
    TaskListEntry,
};
use taskmesh_core::{CallerId, Priority, TaskId};

use client::HttpClient;

/// TaskMesh CLI - Control plane management tool
#[derive(Parser)]
#[command(name = "taskmesh")]
#[command(about = "CLI for the TaskMesh control plane", long_about = None)]
struct Cli {
    /// Control plane base URL
    #[arg(short, long, default_value = "http://127.0.0.1:7070")]
    server: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(p: PriorityArg) -> Self {
        match p {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task
    Submit {
        /// Submitting caller
        #[arg(short, long)]
        caller: String,

        /// Required capability tag (repeatable)
        #[arg(short, long = "tag", required = true)]
        tags: Vec<String>,

        #[arg(short, long, value_enum, default_value = "normal")]
        priority: PriorityArg,

        /// Declared run time in milliseconds
        #[arg(short, long, default_value_t = 1000)]
        duration_ms: i64,

        /// Payload text, sent base64-encoded
        #[arg(long, default_value = "")]
        payload: String,

        /// Explicit task id
        #[arg(long)]
        id: Option<String>,
    },

    /// Get task status
    Status {
        /// Task ID
        id: String,
    },

    /// Cancel a task
    Cancel {
        /// Task ID to cancel
        id: String,
    },

    /// List all tasks
    #[command(name = "list-tasks")]
    ListTasks,

    /// List registered backends
    #[command(name = "list-backends")]
    ListBackends,

    /// Show recent alerts
    Alerts,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = HttpClient::new(&cli.server);
    let json = cli.json;

    match cli.command {
        Commands::Submit {
            caller,
            tags,
            priority,
            duration_ms,
            payload,
            id,
        } => {
            let request = SubmitRequest {
                task_id: id.map(TaskId::new),
                caller_id: CallerId::new(caller),
                capability_tags: tags,
                priority: priority.into(),
                estimated_duration_ms: duration_ms,
                payload: STANDARD.encode(payload.as_bytes()),
            };
            let response: SubmitResponse = client.post_json("/v1/tasks", Some(&request)).await?;
            emit(json, &response, |r| println!("Task submitted: {}", r.task_id))?;
        }
        Commands::Status { id } => {
            let status: StatusResponse = client.get_json(&format!("/v1/tasks/{id}")).await?;
            emit(json, &status, print_status)?;
        }
        Commands::Cancel { id } => {
            let response: CancelResponse = client
                .post_json::<(), _>(&format!("/v1/tasks/{id}/cancel"), None)
                .await?;
            emit(json, &response, |r| {
                if r.accepted {
                    println!("Task {id} cancelled");
                } else {
                    println!("Task {id} already finished; nothing to cancel");
                }
            })?;
        }
        Commands::ListTasks => {
            let tasks: Vec<TaskListEntry> = client.get_json("/v1/tasks").await?;
            emit(json, &tasks, |t| list_tasks(t))?;
        }
        Commands::ListBackends => {
            let backends: Vec<BackendResponse> = client.get_json("/v1/backends").await?;
            emit(json, &backends, |b| list_backends(b))?;
        }
        Commands::Alerts => {
            let alerts: Vec<AlertResponse> = client.get_json("/v1/alerts").await?;
            emit(json, &alerts, |alerts| {
                for alert in alerts {
                    println!(
                        "{}  {:<20}  {:<24}  {}",
                        alert.raised_at.format("%Y-%m-%d %H:%M:%S"),
                        alert.kind,
                        alert.subject,
                        alert.message
                    );
                }
            })?;
        }
    }

    Ok(())
}

/// Print `value` as pretty JSON, or hand it to the table printer.
fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_status(status: &StatusResponse) {
    println!("  ID:         {}", status.task_id);
    println!("  State:      {}", status.state);
    println!("  Attempts:   {}", status.attempts);
    if let Some(backend) = &status.assigned_backend {
        println!("  Backend:    {backend}");
    }
    if let Some(result) = &status.result {
        println!("  Result:     {result}");
    }
    if let Some(error) = &status.error {
        println!("  Error:      {} ({})", error.message, error.reason);
    }
}

fn list_tasks(tasks: &[TaskListEntry]) {
    println!("Tasks ({}):", tasks.len());
    println!(
        "{:<36}  {:<10}  {:<8}  {:<16}  {}",
        "ID", "STATE", "PRIORITY", "BACKEND", "SUBMITTED"
    );
    println!("{}", "-".repeat(96));

    for task in tasks {
        let backend = task
            .assigned_backend
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<10}  {:<8}  {:<16}  {}",
            task.task_id.to_string(),
            task.state.to_string(),
            format!("{:?}", task.priority),
            backend,
            task.submitted_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn list_backends(backends: &[BackendResponse]) {
    println!("Backends ({}):", backends.len());
    println!(
        "{:<24}  {:<12}  {:<8}  {:<8}  {}",
        "ID", "HEALTH", "LOAD", "SUCCESS", "TAGS"
    );
    println!("{}", "-".repeat(80));

    for backend in backends {
        println!(
            "{:<24}  {:<12}  {:<8}  {:<8}  {}",
            backend.id.to_string(),
            backend.health.to_string(),
            format!("{}/{}", backend.current_load, backend.capacity),
            format!("{:.0}%", backend.success_rate * 100.0),
            backend.capability_tags.join(", ")
        );
    }
}
