pub mod connections;
pub mod health;

use axum::{http::StatusCode, Json};
use orgdesk_database::DatabaseError;
use serde::Serialize;

/// Seconds a client should wait before retrying after hitting its quota.
const QUOTA_RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            retry_after: None,
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Translate a registry or database failure into an HTTP response.
pub fn database_error(err: DatabaseError) -> ApiError {
    let (status, code) = match &err {
        DatabaseError::UserNotFound(_) => (StatusCode::NOT_FOUND, "user_not_found"),
        DatabaseError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        DatabaseError::QuotaExceeded { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "connection_quota_exceeded")
        }
        DatabaseError::ConnectionError(_) | DatabaseError::ConnectionFailed(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "database_unavailable")
        }
        DatabaseError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        DatabaseError::Internal(_) | DatabaseError::Other(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    };

    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    }

    let mut body = ErrorResponse::new(code, &err.to_string());
    if err.is_retryable() {
        body.retry_after = Some(QUOTA_RETRY_AFTER_SECS);
    }

    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_quota_exceeded_maps_to_429_with_retry_hint() {
        let (status, Json(body)) = database_error(DatabaseError::QuotaExceeded {
            user_id: Uuid::new_v4(),
            max_connections: 2,
        });

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.error, "connection_quota_exceeded");
        assert_eq!(body.retry_after, Some(QUOTA_RETRY_AFTER_SECS));
    }

    #[test]
    fn test_lookup_failures_map_to_404() {
        let (status, Json(body)) = database_error(DatabaseError::UserNotFound(Uuid::new_v4()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "user_not_found");
        assert!(body.retry_after.is_none());

        let (status, _) = database_error(DatabaseError::not_found("Connection lease", "1"));
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_driver_failures_map_to_503() {
        let (status, Json(body)) =
            database_error(DatabaseError::ConnectionFailed("refused".to_string()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.error, "database_unavailable");

        let (status, _) = database_error(DatabaseError::ConnectionError(sqlx::Error::PoolTimedOut));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_body_omits_missing_retry_hint() {
        let (_, Json(body)) = database_error(DatabaseError::Internal("boom".to_string()));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "internal_error");
        assert!(json.get("retry_after").is_none());
    }
}
