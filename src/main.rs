use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hostkeeper::api::{create_router, ApiState};
use hostkeeper::cli::Args;
use hostkeeper::config::{load_config_file, Config};
use hostkeeper::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_filter())),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let (path, explicit) = args.config_path();
    if !explicit && !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return Ok(args.apply(Config::default()));
    }
    let config = load_config_file(&path)
        .with_context(|| format!("Failed to load config file {}", path.display()))?;
    Ok(args.apply(config))
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let config = load_config(&args)?;
    let addr = config.listen_addr()?;

    let supervisor = Supervisor::start(&config).context("Failed to start components")?;
    let app = create_router(ApiState::new(supervisor.host_service()));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health           - Health check");
    info!("  GET  /api/v0/status    - Component status");
    info!("  *    /api/v0/host/...  - Host provisioning");
    info!("  *    /api/v0/cluster/... - Cluster management");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    supervisor.shutdown().await;
    served.context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
