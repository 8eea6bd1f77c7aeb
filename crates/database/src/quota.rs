//! Quota policies
//!
//! Resolve a user to the maximum number of connections it may hold at once.
//! Policies are read-only: they never touch pools or the registry.

use crate::error::{DatabaseError, Result};
use crate::repositories::users::UserRepository;
use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait QuotaPolicy: Send + Sync {
    /// Maximum concurrent connections for `user_id`, or
    /// [`DatabaseError::UserNotFound`] when the user is unknown.
    async fn max_connections(&self, user_id: Uuid) -> Result<u32>;
}

/// Fixed in-memory quotas.
#[derive(Debug, Clone, Default)]
pub struct StaticQuotaPolicy {
    limits: HashMap<Uuid, u32>,
}

impl StaticQuotaPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: Uuid, max_connections: u32) -> Self {
        self.set(user_id, max_connections);
        self
    }

    /// Register or replace a quota. Zero is stored as one.
    pub fn set(&mut self, user_id: Uuid, max_connections: u32) {
        self.limits.insert(user_id, max_connections.max(1));
    }
}

#[async_trait]
impl QuotaPolicy for StaticQuotaPolicy {
    async fn max_connections(&self, user_id: Uuid) -> Result<u32> {
        self.limits
            .get(&user_id)
            .copied()
            .ok_or(DatabaseError::UserNotFound(user_id))
    }
}

/// Quotas read from the `users.max_connections` column.
///
/// Deactivated users are treated as unknown, so they cannot open new
/// connections.
#[derive(Clone)]
pub struct PgQuotaPolicy {
    users: UserRepository,
}

impl PgQuotaPolicy {
    pub fn new(users: UserRepository) -> Self {
        Self { users }
    }
}

#[async_trait]
impl QuotaPolicy for PgQuotaPolicy {
    async fn max_connections(&self, user_id: Uuid) -> Result<u32> {
        let user = match self.users.find_by_id(user_id).await {
            Ok(user) => user,
            Err(DatabaseError::NotFound(_)) => return Err(DatabaseError::UserNotFound(user_id)),
            Err(e) => return Err(e),
        };

        if !user.is_active {
            tracing::debug!(%user_id, "Connection quota requested for inactive user");
            return Err(DatabaseError::UserNotFound(user_id));
        }

        Ok(user.connection_quota())
    }
}

/// Caches successful lookups of another policy.
///
/// Unknown users are not cached, so a user created after a failed lookup is
/// picked up on the next call.
pub struct CachedQuotaPolicy<P> {
    inner: P,
    cache: Cache<Uuid, u32>,
}

impl<P: QuotaPolicy> CachedQuotaPolicy<P> {
    pub fn new(inner: P, max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self { inner, cache }
    }

    /// Drop the cached quota of a user after an administrative change.
    pub async fn invalidate(&self, user_id: Uuid) {
        self.cache.invalidate(&user_id).await;
    }
}

#[async_trait]
impl<P: QuotaPolicy> QuotaPolicy for CachedQuotaPolicy<P> {
    async fn max_connections(&self, user_id: Uuid) -> Result<u32> {
        if let Some(limit) = self.cache.get(&user_id).await {
            return Ok(limit);
        }

        let limit = self.inner.max_connections(user_id).await?;
        self.cache.insert(user_id, limit).await;

        tracing::debug!(%user_id, limit, "cached connection quota");
        Ok(limit)
    }
}
