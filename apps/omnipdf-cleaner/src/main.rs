//! OmniPDF Cleaner
//!
//! Tracks which documents belong to which browser session and removes
//! everything a session or scheduled flag leaves behind once it expires.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use omnipdf_cleaner::cleaner::{Dispatcher, Watcher};
use omnipdf_cleaner::config::Config;
use omnipdf_cleaner::routes;
use omnipdf_cleaner::session::SessionStore;
use omnipdf_cleaner::state::AppState;
use omnipdf_cleaner::storage::S3Client;
use omnipdf_cleaner::store::RedisStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "omnipdf_cleaner=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Starting OmniPDF Cleaner v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("S3 endpoint: {}", config.storage.endpoint);
    tracing::info!("S3 bucket: {}", config.storage.bucket);

    let store = Arc::new(
        RedisStore::connect(&config.redis.url)
            .await
            .context("Failed to connect to the keyed store")?,
    );
    let s3_client = S3Client::new(&config.storage)
        .await
        .context("Failed to initialize S3 client")?;

    let dispatcher = Dispatcher::new(store.clone(), Arc::new(s3_client));
    let watcher = Arc::new(Watcher::new(
        store.clone(),
        dispatcher,
        config.watcher.clone(),
    ));
    let watcher_handle = watcher
        .start()
        .await
        .context("Failed to subscribe to keyspace notifications")?;

    let sessions = SessionStore::new(store.clone(), &config.session);
    let app_state = AppState::new(config.clone(), store, sessions, watcher);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST {:?}", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.port);
    tracing::info!("OmniPDF Cleaner listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    watcher_handle.stop();
    if tokio::time::timeout(config.server.shutdown_timeout, watcher_handle.join())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = config.server.shutdown_timeout.as_secs(),
            "Watcher did not stop in time"
        );
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
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
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
