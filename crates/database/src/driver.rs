//! Underlying connection driver
//!
//! The registry never opens physical connections itself. It goes through a
//! [`ConnectionDriver`], which knows how to build a bounded pool for one user
//! and lend connections out of it.

use crate::error::Result;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait ConnectionDriver: Send + Sync + 'static {
    /// Bounded set of physical connections owned by one user.
    type Pool: Send + Sync + 'static;
    /// One physical connection lent out of a pool.
    type Connection: Send + 'static;

    /// Open a pool holding at most `max_connections` connections.
    async fn open_pool(&self, user_id: Uuid, max_connections: u32) -> Result<Self::Pool>;

    /// Take a connection out of `pool`.
    async fn checkout(&self, pool: &Self::Pool) -> Result<Self::Connection>;

    /// Hand a connection back to `pool`. Must not block.
    fn checkin(&self, pool: &Self::Pool, connection: Self::Connection);

    /// Cheap round trip proving the connection is usable.
    async fn ping(&self, connection: &mut Self::Connection) -> Result<()>;

    async fn close_pool(&self, pool: &Self::Pool);
}

/// Settings applied to every per-user PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgDriverConfig {
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PgDriverConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PgDriverConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            acquire_timeout: std::env::var("USER_POOL_ACQUIRE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            idle_timeout: std::env::var("USER_POOL_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
        }
    }
}

/// PostgreSQL driver backed by sqlx pools.
#[derive(Clone)]
pub struct PgDriver {
    options: PgConnectOptions,
    config: PgDriverConfig,
}

impl PgDriver {
    pub fn new(options: PgConnectOptions, config: PgDriverConfig) -> Self {
        Self { options, config }
    }
}

#[async_trait]
impl ConnectionDriver for PgDriver {
    type Pool = PgPool;
    type Connection = PoolConnection<Postgres>;

    async fn open_pool(&self, user_id: Uuid, max_connections: u32) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(0)
            .acquire_timeout(self.config.acquire_timeout)
            .idle_timeout(self.config.idle_timeout)
            .connect_with(self.options.clone())
            .await?;

        tracing::info!(
            %user_id,
            max_connections,
            "Opened PostgreSQL pool for user"
        );

        Ok(pool)
    }

    async fn checkout(&self, pool: &PgPool) -> Result<PoolConnection<Postgres>> {
        Ok(pool.acquire().await?)
    }

    fn checkin(&self, _pool: &PgPool, connection: PoolConnection<Postgres>) {
        // sqlx returns the connection to its pool on drop
        drop(connection);
    }

    async fn ping(&self, connection: &mut PoolConnection<Postgres>) -> Result<()> {
        sqlx::query("SELECT 1").execute(&mut **connection).await?;
        Ok(())
    }

    async fn close_pool(&self, pool: &PgPool) {
        pool.close().await;
    }
}
