//! Per-user connection endpoints
//!
//! Thin consumers of the connection registry: every database round trip made
//! here goes through the user's quota.

use crate::handlers::{database_error, ApiError};
use crate::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use orgdesk_database::QuotaPolicy;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ConnectionUsageResponse {
    pub user_id: Uuid,
    pub checked_out: usize,
    pub max_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub user_id: Uuid,
    pub lease_id: Uuid,
    pub latency_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct ResetPoolResponse {
    pub user_id: Uuid,
    pub torn_down: bool,
}

/// Current usage against the user's quota
/// GET /api/users/:user_id/connections
pub async fn connection_usage(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ConnectionUsageResponse>, ApiError> {
    let max_connections = state
        .quota_policy
        .max_connections(user_id)
        .await
        .map_err(database_error)?;

    Ok(Json(ConnectionUsageResponse {
        user_id,
        checked_out: state.registry.checked_out(user_id),
        max_connections,
    }))
}

/// Round trip to the database on one of the user's connections
/// POST /api/users/:user_id/ping
pub async fn ping_database(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<PingResponse>, ApiError> {
    let started = Instant::now();

    let mut conn = state
        .registry
        .acquire_scoped(user_id)
        .await
        .map_err(database_error)?;
    conn.ping().await.map_err(database_error)?;

    let lease_id = conn.lease_id();
    conn.release().map_err(database_error)?;

    Ok(Json(PingResponse {
        user_id,
        lease_id,
        latency_ms: started.elapsed().as_millis(),
    }))
}

/// Forget the cached quota and close the user's idle pool, so a changed
/// `max_connections` takes effect on the next acquisition
/// DELETE /api/users/:user_id/pool
pub async fn reset_user_pool(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ResetPoolResponse>, ApiError> {
    state.quota_policy.invalidate(user_id).await;

    let torn_down = state
        .registry
        .teardown_user(user_id)
        .await
        .map_err(database_error)?;

    tracing::info!(%user_id, torn_down, "Reset user connection pool");

    Ok(Json(ResetPoolResponse { user_id, torn_down }))
}
