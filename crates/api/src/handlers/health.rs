use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use orgdesk_database::{PoolHealth, PoolStatus, RegistryStats};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct PoolsHealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub stats: RegistryStats,
    pub pools: Vec<PoolHealth>,
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Administrative database status plus a probe of every user pool
/// GET /health/pools
pub async fn pools_health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<PoolsHealthResponse>) {
    let database = match state.db.ping().await {
        Ok(()) => "up",
        Err(e) => {
            tracing::warn!("Administrative database ping failed: {}", e);
            "down"
        }
    };

    let pools = state.registry.health_check().await;
    let degraded =
        database == "down" || pools.iter().any(|pool| pool.status == PoolStatus::Unhealthy);

    let (code, status) = if degraded {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        code,
        Json(PoolsHealthResponse {
            status,
            database,
            stats: state.registry.stats(),
            pools,
        }),
    )
}
