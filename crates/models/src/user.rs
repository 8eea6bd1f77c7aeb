use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Connection quota assumed when a user row carries no usable value.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,

    // NULL for platform-level accounts
    pub organization_id: Option<Uuid>,

    pub email: String,

    /// Maximum number of database connections this user may hold at once
    pub max_connections: i32,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Concurrent connection quota, always at least one.
    pub fn connection_quota(&self) -> u32 {
        normalize_quota(self.max_connections)
    }
}

/// Map a stored `max_connections` column onto a positive quota.
pub fn normalize_quota(stored: i32) -> u32 {
    if stored < 1 {
        DEFAULT_MAX_CONNECTIONS
    } else {
        stored as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_quota(max_connections: i32) -> User {
        User {
            id: Uuid::new_v4(),
            organization_id: None,
            email: "ops@example.com".to_string(),
            max_connections,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_connection_quota_passes_positive_values_through() {
        assert_eq!(user_with_quota(1).connection_quota(), 1);
        assert_eq!(user_with_quota(12).connection_quota(), 12);
    }

    #[test]
    fn test_connection_quota_defaults_non_positive_values() {
        assert_eq!(user_with_quota(0).connection_quota(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(user_with_quota(-4).connection_quota(), DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_user_serializes_quota() {
        let user = user_with_quota(3);
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["max_connections"], 3);
        assert!(json["organization_id"].is_null());
    }
}
