//! Inbetweenies Server
//!
//! The server half of the Inbetweenies v2 sync protocol: a knowledge-graph
//! store reachable over `/api/v1/sync/*`, reconciling changes from any
//! number of offline-first clients.

use axum::Router;
use std::net::SocketAddr;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod routes;
mod state;
mod sync;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inbetweenies_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("failed to load config from env: {e}, using defaults");
        Config::default()
    });

    tracing::info!("starting Inbetweenies Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("database: {}", config.database.url);

    let pool = db::create_pool(&config.database.url)
        .await
        .expect("failed to initialize database");
    let store = inbetweenies_store::SqliteGraphStore::new(pool.clone());
    let tombstones = db::load_tombstones(&pool).await.unwrap_or_else(|e| {
        tracing::warn!("failed to hydrate tombstone log: {e}, starting empty");
        inbetweenies_core::delta::TombstoneLog::new()
    });

    let app_state = AppState::new(config.clone(), store, tombstones);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api/v1/health", routes::health::router())
        .nest("/api/v1/sync", routes::sync::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Inbetweenies Server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    tracing::info!("server shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
            tracing::info!("received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown...");
        },
    }
}
