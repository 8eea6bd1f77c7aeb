use crate::handlers;
use crate::AppState;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))
        .route("/health/pools", get(handlers::health::pools_health))
        // Per-user connections
        .route(
            "/api/users/:user_id/connections",
            get(handlers::connections::connection_usage),
        )
        .route(
            "/api/users/:user_id/ping",
            post(handlers::connections::ping_database),
        )
        .route(
            "/api/users/:user_id/pool",
            delete(handlers::connections::reset_user_pool),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use orgdesk_database::{
        CachedQuotaPolicy, ConnectionRegistry, Database, DatabaseConfig, PgDriver,
        PgDriverConfig, PgQuotaPolicy, UserRepository,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    fn lazy_state() -> Arc<AppState> {
        let db = Database::connect_lazy(DatabaseConfig::default()).unwrap();
        let quota_policy = Arc::new(CachedQuotaPolicy::new(
            PgQuotaPolicy::new(UserRepository::new(db.pool().clone())),
            100,
            Duration::from_secs(60),
        ));
        let driver = PgDriver::new(db.connect_options().clone(), PgDriverConfig::default());
        let registry = Arc::new(ConnectionRegistry::new(quota_policy.clone(), driver));

        Arc::new(AppState {
            db,
            registry,
            quota_policy,
        })
    }

    #[tokio::test]
    async fn test_health_route() {
        let app = create_router(lazy_state());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_malformed_user_id_is_rejected() {
        let app = create_router(lazy_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/users/not-a-uuid/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reset_of_unknown_pool_reports_nothing_torn_down() {
        let app = create_router(lazy_state());
        let user_id = uuid::Uuid::new_v4();

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/users/{}/pool", user_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["torn_down"], false);
    }
}
