//! Scoped connection leases
//!
//! [`ScopedConnection`] releases its lease when it goes out of scope, whether
//! the caller returns normally, bails out with `?`, or panics.

use crate::driver::ConnectionDriver;
use crate::error::Result;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use uuid::Uuid;

pub struct ScopedConnection<D: ConnectionDriver> {
    registry: Arc<ConnectionRegistry<D>>,
    handle: ConnectionHandle<D>,
}

impl<D: ConnectionDriver> ScopedConnection<D> {
    pub(crate) fn new(registry: Arc<ConnectionRegistry<D>>, handle: ConnectionHandle<D>) -> Self {
        Self { registry, handle }
    }

    pub fn user_id(&self) -> Uuid {
        self.handle.user_id()
    }

    pub fn lease_id(&self) -> Uuid {
        self.handle.lease_id()
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.handle.ping().await
    }

    /// Release now and report the outcome instead of leaving it to `Drop`.
    pub fn release(mut self) -> Result<()> {
        let user_id = self.handle.user_id();
        self.registry.release(user_id, &mut self.handle)
    }
}

impl<D: ConnectionDriver> Deref for ScopedConnection<D> {
    type Target = D::Connection;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<D: ConnectionDriver> DerefMut for ScopedConnection<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.handle
    }
}

impl<D: ConnectionDriver> Drop for ScopedConnection<D> {
    fn drop(&mut self) {
        if self.handle.is_released() {
            return;
        }

        let user_id = self.handle.user_id();
        if let Err(e) = self.registry.release(user_id, &mut self.handle) {
            tracing::error!(
                %user_id,
                lease_id = %self.handle.lease_id(),
                error = %e,
                "Scoped connection release failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::error::DatabaseError;
    use crate::quota::StaticQuotaPolicy;

    fn registry_for(user_id: Uuid, max: u32) -> Arc<ConnectionRegistry<MockDriver>> {
        let policy = StaticQuotaPolicy::new().with_user(user_id, max);
        Arc::new(ConnectionRegistry::new(Arc::new(policy), MockDriver::new()))
    }

    async fn failing_work(
        registry: &Arc<ConnectionRegistry<MockDriver>>,
        user_id: Uuid,
    ) -> Result<()> {
        let mut conn = registry.acquire_scoped(user_id).await?;
        conn.ping().await?;
        Err(DatabaseError::InvalidInput("bad payload".to_string()))
    }

    #[tokio::test]
    async fn test_scope_exit_releases_lease() {
        let user_id = Uuid::new_v4();
        let registry = registry_for(user_id, 1);

        {
            let conn = registry.acquire_scoped(user_id).await.unwrap();
            assert_eq!(conn.user_id(), user_id);
            assert_eq!(conn.pool_in_use(), 1);
            assert_eq!(registry.checked_out(user_id), 1);
        }

        assert_eq!(registry.checked_out(user_id), 0);
        assert!(registry.acquire_scoped(user_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_error_path_releases_exactly_once() {
        let user_id = Uuid::new_v4();
        let registry = registry_for(user_id, 1);

        assert!(matches!(
            failing_work(&registry, user_id).await,
            Err(DatabaseError::InvalidInput(_))
        ));
        assert_eq!(registry.checked_out(user_id), 0);

        // The quota is fully available again
        let conn = registry.acquire_scoped(user_id).await.unwrap();
        conn.release().unwrap();
        assert_eq!(registry.checked_out(user_id), 0);
    }

    fn explode() {
        panic!("handler blew up");
    }

    #[tokio::test]
    async fn test_panic_releases_lease() {
        let user_id = Uuid::new_v4();
        let registry = registry_for(user_id, 1);

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _conn = registry.acquire_scoped(user_id).await.unwrap();
                explode();
            })
        };

        let outcome = task.await;
        assert!(outcome.unwrap_err().is_panic());
        assert_eq!(registry.checked_out(user_id), 0);
    }

    #[tokio::test]
    async fn test_explicit_release_is_not_repeated_on_drop() {
        let user_id = Uuid::new_v4();
        let registry = registry_for(user_id, 2);

        let first = registry.acquire_scoped(user_id).await.unwrap();
        let _second = registry.acquire_scoped(user_id).await.unwrap();
        assert_eq!(registry.checked_out(user_id), 2);

        first.release().unwrap();
        assert_eq!(registry.checked_out(user_id), 1);
    }

    #[tokio::test]
    async fn test_scoped_acquire_respects_quota() {
        let user_id = Uuid::new_v4();
        let registry = registry_for(user_id, 1);

        let _held = registry.acquire_scoped(user_id).await.unwrap();
        assert!(matches!(
            registry.acquire_scoped(user_id).await,
            Err(DatabaseError::QuotaExceeded { .. })
        ));
    }
}
