use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunnelhub_broker::config::{Args, BrokerConfig};
use tunnelhub_broker::handlers::spawn_cleanup_task;
use tunnelhub_broker::{AppState, build_router};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = BrokerConfig::from_args(args);
    let addr = config.socket_addr()?;

    info!("Tunnel broker v{}", env!("CARGO_PKG_VERSION"));
    info!("Public URL: {}", config.public_url);
    info!("Entry page: {}/entry", config.web_url);
    info!(
        "Request timeout {}s, max payload {} bytes",
        config.request_timeout.as_secs(),
        config.max_body_size
    );

    let state = AppState::new(config);
    let cleanup = spawn_cleanup_task(&state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cleanup.abort();
    info!("Broker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C, shutting down gracefully...");
}
