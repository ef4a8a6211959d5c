//! Carry Server - Sync server for local-first data synchronization.
//!
//! This server provides HTTP and WebSocket endpoints for Flutter clients to sync their
//! local data with the server using the carry-engine reconciliation logic.

mod auth;
mod config;
mod db;
mod error;
mod handlers;
mod routes;
mod websocket;

use crate::config::Config;
use crate::db::PostgresAdapter;
use crate::websocket::ConnectionManager;
use axum::Router;
use carry_engine::{attach_policies, PolicyGuard, PolicySet};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub adapter: Arc<PostgresAdapter>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
    pub policies: Arc<PolicyGuard>,
}

/// Loads the row-level security policy set from `policy_path` if configured,
/// falling back to an allow-everything set so an unconfigured server behaves
/// exactly as it did before RLS enforcement existed.
fn load_policies(policy_path: Option<&str>) -> Result<PolicyGuard, Box<dyn std::error::Error>> {
    let policy_set = match policy_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read POLICY_PATH {path}: {e}"))?;
            serde_json::from_str::<PolicySet>(&raw)
                .map_err(|e| format!("failed to parse policy set at {path}: {e}"))?
        }
        None => PolicySet::allow_all(),
    };
    Ok(attach_policies(policy_set))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carry_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Carry Server on {}:{}", config.host, config.port);

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    // Build application state
    let conn_manager = ConnectionManager::new_shared();
    let policies = Arc::new(load_policies(config.policy_path.as_deref())?);
    let state = AppState {
        adapter: Arc::new(PostgresAdapter::new(pool)),
        config: Arc::new(config.clone()),
        conn_manager,
        policies,
    };

    // Build router
    let app = Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
