use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("User {0} not found")]
    UserNotFound(Uuid),

    #[error("User {user_id} already holds its maximum of {max_connections} connection(s)")]
    QuotaExceeded { user_id: Uuid, max_connections: u32 },

    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Other(String),
}

impl DatabaseError {
    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{} with id {} not found", entity, id))
    }

    /// Whether the caller may retry the same request later and expect success.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

// Note: From<sqlx::Error> is automatically implemented via #[from] attribute above

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_quota_exceeded_is_retryable() {
        let user_id = Uuid::new_v4();
        assert!(DatabaseError::QuotaExceeded {
            user_id,
            max_connections: 1
        }
        .is_retryable());
        assert!(!DatabaseError::UserNotFound(user_id).is_retryable());
        assert!(!DatabaseError::not_found("Connection lease", "abc").is_retryable());
        assert!(!DatabaseError::ConnectionFailed("refused".to_string()).is_retryable());
    }

    #[test]
    fn test_not_found_message() {
        let err = DatabaseError::not_found("Connection lease", "42");
        assert_eq!(
            err.to_string(),
            "Entity not found: Connection lease with id 42 not found"
        );
    }
}
