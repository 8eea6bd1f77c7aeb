//! Per-user pool lifecycle
//!
//! One bounded pool per user, opened lazily on that user's first acquisition
//! and reused afterwards. Racing first acquisitions share a single open.

use crate::driver::ConnectionDriver;
use crate::error::{DatabaseError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Bounded pool of physical connections belonging to one user.
pub struct UserPool<D: ConnectionDriver> {
    user_id: Uuid,
    max_connections: u32,
    created_at: DateTime<Utc>,
    inner: D::Pool,
    driver: Arc<D>,
}

impl<D: ConnectionDriver> UserPool<D> {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Capacity the pool was opened with.
    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn driver(&self) -> &D {
        &self.driver
    }

    pub(crate) async fn checkout(&self) -> Result<D::Connection> {
        self.driver.checkout(&self.inner).await
    }

    pub(crate) fn checkin(&self, connection: D::Connection) {
        self.driver.checkin(&self.inner, connection);
    }

    pub(crate) async fn close(&self) {
        self.driver.close_pool(&self.inner).await;
    }
}

/// Owns the user → pool mapping.
pub struct PoolManager<D: ConnectionDriver> {
    driver: Arc<D>,
    pools: DashMap<Uuid, Arc<OnceCell<Arc<UserPool<D>>>>>,
}

impl<D: ConnectionDriver> PoolManager<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            pools: DashMap::new(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Return the user's pool, opening it with `max_connections` slots if it
    /// does not exist yet.
    ///
    /// The map entry is claimed under the shard lock, but the driver's open
    /// call runs outside it, so opening one user's pool never stalls another
    /// user. Concurrent callers for the same user wait on the same open.
    pub async fn get_or_create_pool(
        &self,
        user_id: Uuid,
        max_connections: u32,
    ) -> Result<Arc<UserPool<D>>> {
        let cell = self.pools.entry(user_id).or_default().value().clone();

        let pool = cell
            .get_or_try_init(|| async {
                let inner = self.driver.open_pool(user_id, max_connections).await?;

                tracing::info!(
                    %user_id,
                    max_connections,
                    "Created connection pool for user"
                );

                Ok::<_, DatabaseError>(Arc::new(UserPool {
                    user_id,
                    max_connections,
                    created_at: Utc::now(),
                    inner,
                    driver: self.driver.clone(),
                }))
            })
            .await?;

        Ok(pool.clone())
    }

    /// Existing pool of a user, if one has been opened.
    pub fn get(&self, user_id: Uuid) -> Option<Arc<UserPool<D>>> {
        self.pools
            .get(&user_id)
            .and_then(|cell| cell.value().get().cloned())
    }

    /// Number of opened pools. Entries whose open failed are not counted.
    pub fn pool_count(&self) -> usize {
        self.pools
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn user_ids(&self) -> Vec<Uuid> {
        self.pools
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Forget a user's opened pool. The caller is responsible for closing it.
    ///
    /// A pool that is still being opened stays in place: its opener is about
    /// to hand it out, and a detached pool would never be closed.
    pub fn remove(&self, user_id: Uuid) -> Option<Arc<UserPool<D>>> {
        self.pools
            .remove_if(&user_id, |_, cell| cell.initialized())
            .and_then(|(_, cell)| cell.get().cloned())
    }

    /// Close and forget every pool, waiting for opens still in flight.
    pub async fn close_all(&self) {
        let cells: Vec<(Uuid, Arc<OnceCell<Arc<UserPool<D>>>>)> = self
            .pools
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (user_id, cell) in cells {
            // Resolves once a concurrent open settles; fails if there was none
            // or it failed.
            let opened = cell
                .get_or_try_init(|| async {
                    Err(DatabaseError::Internal(format!(
                        "no pool opened for user {}",
                        user_id
                    )))
                })
                .await
                .ok()
                .cloned();

            self.pools
                .remove_if(&user_id, |_, current| Arc::ptr_eq(current, &cell));

            if let Some(pool) = opened {
                pool.close().await;
            }
        }

        tracing::info!("Closed all user connection pools");
    }
}
