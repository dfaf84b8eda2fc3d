use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hf_hub::api::tokio::Api;
use scrawl_core::{DeviceMap, HubLoader, PipelineManager, StudioConfig};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod state;

use state::AppState;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Scrawl sketch-to-image studio server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Path to a JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1", env = "SCRAWL_HOST")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000, env = "SCRAWL_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scrawl_server=info,scrawl_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => StudioConfig::from_file(path)?,
        None => StudioConfig::default(),
    };
    if args.cpu {
        config.device = DeviceMap::ForceCpu;
    }

    let loader = HubLoader::new(Api::new()?);
    let manager = Arc::new(PipelineManager::load_with(&config, &loader).await);
    if let Some(err) = manager.load_error() {
        warn!("starting without ready pipelines: {}", err.user_message());
    }
    info!("{}", manager.load_status());

    let app_state = AppState::new(manager, config);

    // --- Build axum router with shared state ---
    let app = api::router(app_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Resolves when Ctrl+C or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
