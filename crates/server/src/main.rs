mod api;
mod cli;
mod router;
mod source;
mod startup;
mod state;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::info;

use crate::cli::{Cli, Command};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    config.log_summary();

    match cli.command.unwrap_or_default() {
        Command::Serve => serve(config).await,
        Command::Cleanup => cleanup(config).await,
    }
}

async fn serve(config: stupid_core::Config) -> anyhow::Result<()> {
    let service = startup::build_export_service(&config).await?;
    let shutdown = Arc::new(Notify::new());
    let background = startup::spawn_background(&service, &shutdown);

    let state = Arc::new(AppState::new(service.clone(), config.redacted_summary()));
    let app = router::build_router(state, &config.server.cors_origin);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            signal.notify_waiters();
        })
        .await?;

    for handle in background {
        handle.abort();
    }
    let running = service.active_jobs().await;
    if running > 0 {
        info!(running, "Exiting with export jobs still running");
    }
    Ok(())
}

/// Run a single cleanup sweep and print its report.
async fn cleanup(config: stupid_core::Config) -> anyhow::Result<()> {
    let service = startup::build_export_service(&config).await?;
    let report = service.run_cleanup().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
