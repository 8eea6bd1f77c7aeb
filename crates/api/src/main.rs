// Orgdesk API Server
// Per-user database connection quotas for the multi-tenant CRUD backend

mod config;
mod handlers;
mod routes;

use anyhow::Context;
use config::Config;
use dotenvy::dotenv;
use orgdesk_database::{
    CachedQuotaPolicy, ConnectionRegistry, Database, PgDriver, PgQuotaPolicy, UserRepository,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

pub struct AppState {
    pub db: Database,
    pub registry: Arc<ConnectionRegistry<PgDriver>>,
    pub quota_policy: Arc<CachedQuotaPolicy<PgQuotaPolicy>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,orgdesk_api=debug,tower_http=debug")),
        )
        .init();

    tracing::info!("🚀 Starting Orgdesk API Server");
    tracing::info!("📦 Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env();
    tracing::info!("🔌 Server: {}", config.bind_address());

    // Administrative database, holds the users table
    tracing::info!("🗄️  Connecting to database...");
    let db = Database::new(config.database.clone())
        .await
        .context("Failed to connect to database")?;
    db.ping().await.context("Database ping failed")?;
    tracing::info!("✅ Database connected");

    // Quota lookups are cached so hot users do not hit the users table on
    // every acquisition
    let quota_policy = Arc::new(CachedQuotaPolicy::new(
        PgQuotaPolicy::new(UserRepository::new(db.pool().clone())),
        config.registry.quota_cache_capacity,
        config.registry.quota_cache_ttl,
    ));

    let driver = PgDriver::new(db.connect_options().clone(), config.user_pools.clone());
    let registry = Arc::new(ConnectionRegistry::new(quota_policy.clone(), driver));
    tracing::info!(
        acquire_timeout_secs = config.user_pools.acquire_timeout.as_secs(),
        "✅ Connection registry initialized"
    );

    let leak_monitor = registry.spawn_leak_monitor(
        config.registry.monitor_interval,
        config.registry.leak_threshold,
    );

    let state = Arc::new(AppState {
        db: db.clone(),
        registry: registry.clone(),
        quota_policy,
    });

    // Create router
    let app = routes::create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    tracing::info!("📡 Routes configured:");
    tracing::info!("   GET    /health");
    tracing::info!("   GET    /health/pools");
    tracing::info!("   GET    /api/users/:user_id/connections");
    tracing::info!("   POST   /api/users/:user_id/ping");
    tracing::info!("   DELETE /api/users/:user_id/pool");

    // Start server
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!("✅ Server ready at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("🛑 Shutting down");
    leak_monitor.abort();
    registry.shutdown().await;
    db.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
