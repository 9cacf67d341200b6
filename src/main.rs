use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::{AppState, HttpServer};
use turnstile::ratelimit::BucketRegistry;

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about = "Per-client request rate limiting service")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(short, long)]
    listen_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)?,
        None => TurnstileConfig::default(),
    };
    if let Some(listen_addr) = args.listen_addr {
        config.server.listen_addr = listen_addr;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        burst = config.rate_limiting.burst,
        max_tokens = config.rate_limiting.max_tokens,
        refill_rate_secs = config.rate_limiting.refill_rate_secs,
        cleanup_interval_secs = config.rate_limiting.cleanup_interval_secs,
        "Configuration loaded"
    );

    // Initialize the bucket registry
    let registry = Arc::new(BucketRegistry::new(config.rate_limiting.clone()));
    info!("Bucket registry initialized");

    // Start the eviction loop; it is stopped once the server has drained.
    let (evict_tx, evict_rx) = tokio::sync::oneshot::channel::<()>();
    let eviction = tokio::spawn(Arc::clone(&registry).run_eviction_loop(
        config.rate_limiting.cleanup_interval(),
        async move {
            let _ = evict_rx.await;
        },
    ));

    // Create and start the HTTP server
    let server = HttpServer::new(config.server.listen_addr, AppState { registry });

    // Run the server with graceful shutdown on Ctrl+C or SIGTERM
    server.serve_with_shutdown(shutdown_signal()).await?;

    // Stop the eviction loop
    let _ = evict_tx.send(());
    eviction.await?;

    info!("Turnstile Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
