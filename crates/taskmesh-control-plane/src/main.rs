//! TaskMesh Control Plane Server

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskmesh_control_plane::{http, AppState, Config, ConfigHandle};

#[derive(Parser, Debug)]
#[command(name = "taskmesh-control-plane")]
#[command(about = "TaskMesh control plane - admits, schedules and tracks tasks")]
struct Args {
    /// JSON config file; watched and hot-reloaded
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ConfigHandle::from_file(path)?,
        None => ConfigHandle::new(Config::default()),
    };
    let http_addr: SocketAddr = args
        .bind
        .unwrap_or_else(|| config.current().server.http_bind_addr.clone())
        .parse()?;

    let state = AppState::new(config);
    state.start().await;

    info!(http_addr = %http_addr, "Starting TaskMesh control plane");

    let router = http::create_router(state.clone());
    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    state.shutdown();
    Ok(())
}
