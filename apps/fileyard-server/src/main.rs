//! Fileyard Server
//!
//! Resumable chunked file ingestion with content-addressed deduplication.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fileyard_server::config::Config;
use fileyard_server::db;
use fileyard_server::routes;
use fileyard_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fileyard_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;

    tracing::info!("Starting Fileyard Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage root: {}", config.upload.storage_root.display());
    tracing::info!("Temp root: {}", config.upload.temp_root.display());

    tokio::fs::create_dir_all(&config.upload.storage_root)
        .await
        .context("failed to create storage root")?;
    tokio::fs::create_dir_all(&config.upload.temp_root)
        .await
        .context("failed to create temp root")?;

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let app_state = AppState::new(config.clone(), db_pool);

    // Reclaim leftovers from a previous run, then keep sweeping
    let janitor = app_state.janitor();
    match janitor.sweep(config.upload.temp_retention).await {
        Ok(removed) => tracing::info!(removed = removed, "Startup temp sweep complete"),
        Err(e) => tracing::warn!(error = %e, "Startup temp sweep failed"),
    }
    let sweep_task =
        janitor.start_sweep_task(config.upload.sweep_interval, config.upload.temp_retention);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    tracing::info!("Fileyard Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweep_task.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
