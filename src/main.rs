//! Mini Loader demo service
//!
//! Serves a small blog API whose handlers resolve posts and authors through
//! the batch-loading engine, one scope per request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mini_loader::api::create_router;
use mini_loader::demo::{build_engine, BlogStore};
use mini_loader::{AppState, LoaderConfig, ServerConfig};

/// Simulated latency of one blog store query
const STORE_LATENCY: Duration = Duration::from_millis(5);

/// Main entry point for the demo service.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load loader and server configuration from environment variables
/// 3. Build the engine over a seeded in-memory blog store
/// 4. Start the TTL cleanup task when the cache is shared
/// 5. Serve HTTP until SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mini_loader=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Mini Loader demo service");

    let config = LoaderConfig::from_env();
    let server = ServerConfig::from_env();
    info!(
        "Configuration loaded: max_batch_size={}, max_concurrent_fetches={}, cache_mode={:?}, port={}",
        config.max_batch_size, config.max_concurrent_fetches, config.cache.mode, server.server_port
    );

    let store = Arc::new(BlogStore::seeded(STORE_LATENCY));
    let (engine, stats) =
        build_engine(config, store.clone()).context("invalid loader configuration")?;

    let cleanup_handle = engine.spawn_cleanup_task();
    if cleanup_handle.is_some() {
        info!("Background cleanup task started");
    }

    let app = create_router(AppState::new(engine, stats, store));

    let addr = SocketAddr::from(([0, 0, 0, 0], server.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cleanup_handle))
        .await
        .context("server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM), then aborts the cleanup task.
async fn shutdown_signal(cleanup_handle: Option<JoinHandle<()>>) {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", error);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!("Failed to install SIGTERM handler: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    if let Some(handle) = cleanup_handle {
        handle.abort();
        warn!("Cleanup task aborted");
    }
}
