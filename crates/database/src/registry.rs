//! Connection Registry
//!
//! Hands out database connections to request handlers while enforcing each
//! user's concurrent-connection quota.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ConnectionRegistry                       │
//! │  QuotaPolicy ── user → max_connections                       │
//! │                                                              │
//! │  slots (sharded map)            PoolManager (sharded map)    │
//! │  ┌────────────┐ ┌────────────┐  ┌────────────┐ ┌──────────┐  │
//! │  │ user A     │ │ user B     │  │ user A     │ │ user B   │  │
//! │  │ Mutex<     │ │ Mutex<     │  │ UserPool   │ │ UserPool │  │
//! │  │  leases>   │ │  leases>   │  │ (cap = 1)  │ │ (cap = 4)│  │
//! │  └────────────┘ └────────────┘  └────────────┘ └──────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every user has its own slot lock, so users never contend with each other.
//! A slot lock is only held to check and update the lease set, never across
//! driver I/O. Acquisition fails fast with [`DatabaseError::QuotaExceeded`]
//! instead of queueing; retry policy belongs to the caller.

use crate::driver::ConnectionDriver;
use crate::error::{DatabaseError, Result};
use crate::guard::ScopedConnection;
use crate::pool_manager::{PoolManager, UserPool};
use crate::quota::QuotaPolicy;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Registry tuning, read from the environment by the server binary.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of user quotas kept in the lookup cache
    pub quota_cache_capacity: u64,
    /// How long a cached quota is trusted
    pub quota_cache_ttl: Duration,
    /// Leases held longer than this are reported as possible leaks
    pub leak_threshold: Duration,
    /// How often the leak monitor scans outstanding leases
    pub monitor_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            quota_cache_capacity: 10_000,
            quota_cache_ttl: Duration::from_secs(300),
            leak_threshold: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            quota_cache_capacity: std::env::var("QUOTA_CACHE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.quota_cache_capacity),
            quota_cache_ttl: std::env::var("QUOTA_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.quota_cache_ttl),
            leak_threshold: std::env::var("LEASE_LEAK_THRESHOLD_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.leak_threshold),
            monitor_interval: std::env::var("LEASE_MONITOR_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.monitor_interval),
        }
    }
}

#[derive(Default)]
struct SlotState {
    /// Checked-out leases and when they were taken
    leases: HashMap<Uuid, DateTime<Utc>>,
    /// Limit applied on the most recent acquisition
    limit: u32,
    /// Highest number of simultaneous leases seen
    peak: usize,
}

#[derive(Default)]
struct UserSlot {
    state: Mutex<SlotState>,
}

/// Lease reserved under the slot lock but not yet backed by a connection.
/// Dropping it un-reserves the lease, which covers both driver failures and
/// callers abandoning `acquire` mid-flight.
struct Reservation<'a> {
    slot: &'a UserSlot,
    lease_id: Uuid,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.state.lock().leases.remove(&self.lease_id);
        }
    }
}

/// A leased connection, owned by one caller until passed back to
/// [`ConnectionRegistry::release`].
///
/// Dropping a handle without releasing it returns the physical connection to
/// its pool but leaves the lease counted against the user's quota.
pub struct ConnectionHandle<D: ConnectionDriver> {
    lease_id: Uuid,
    user_id: Uuid,
    acquired_at: DateTime<Utc>,
    connection: Option<D::Connection>,
    pool: Arc<UserPool<D>>,
}

impl<D: ConnectionDriver> ConnectionHandle<D> {
    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn is_released(&self) -> bool {
        self.connection.is_none()
    }

    /// Round trip to the database over this connection.
    pub async fn ping(&mut self) -> Result<()> {
        let pool = self.pool.clone();
        match self.connection.as_mut() {
            Some(connection) => pool.driver().ping(connection).await,
            None => Err(DatabaseError::Internal(format!(
                "connection lease {} already released",
                self.lease_id
            ))),
        }
    }
}

impl<D: ConnectionDriver> Deref for ConnectionHandle<D> {
    type Target = D::Connection;

    /// Panics if the handle has already been released.
    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("BUG: connection handle used after release")
    }
}

impl<D: ConnectionDriver> DerefMut for ConnectionHandle<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("BUG: connection handle used after release")
    }
}

impl<D: ConnectionDriver> Drop for ConnectionHandle<D> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            tracing::warn!(
                user_id = %self.user_id,
                lease_id = %self.lease_id,
                acquired_at = %self.acquired_at,
                "Connection handle dropped without release; lease stays counted"
            );
            self.pool.checkin(connection);
        }
    }
}

/// Snapshot of one user's connection usage.
#[derive(Debug, Clone, Serialize)]
pub struct UserConnectionStats {
    pub user_id: Uuid,
    pub max_connections: u32,
    pub checked_out: usize,
    pub peak_checked_out: usize,
    pub pool_created_at: Option<DateTime<Utc>>,
    pub oldest_lease_at: Option<DateTime<Utc>>,
}

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub tracked_users: usize,
    pub open_pools: usize,
    pub checked_out: usize,
    pub users: Vec<UserConnectionStats>,
}

/// An outstanding lease, as reported by leak diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseInfo {
    pub lease_id: Uuid,
    pub user_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub held_for_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Healthy,
    /// The user holds every connection its quota allows
    Busy,
    /// The pool's user no longer resolves to a quota
    Orphaned,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub user_id: Uuid,
    pub status: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-user connection quota manager.
///
/// Build one per process and share it as `Arc<ConnectionRegistry<_>>`;
/// independent instances are fully isolated from each other.
pub struct ConnectionRegistry<D: ConnectionDriver> {
    policy: Arc<dyn QuotaPolicy>,
    pools: PoolManager<D>,
    slots: DashMap<Uuid, Arc<UserSlot>>,
}

impl<D: ConnectionDriver> ConnectionRegistry<D> {
    pub fn new(policy: Arc<dyn QuotaPolicy>, driver: D) -> Self {
        Self {
            policy,
            pools: PoolManager::new(driver),
            slots: DashMap::new(),
        }
    }

    pub fn pools(&self) -> &PoolManager<D> {
        &self.pools
    }

    fn slot(&self, user_id: Uuid) -> Arc<UserSlot> {
        if let Some(slot) = self.slots.get(&user_id) {
            return slot.value().clone();
        }
        self.slots.entry(user_id).or_default().value().clone()
    }

    fn existing_slot(&self, user_id: Uuid) -> Option<Arc<UserSlot>> {
        self.slots.get(&user_id).map(|slot| slot.value().clone())
    }

    /// Check out a connection for `user_id`.
    ///
    /// Fails with [`DatabaseError::UserNotFound`] for unknown users (no pool
    /// is created), with [`DatabaseError::QuotaExceeded`] when the user already
    /// holds its limit, and with the driver's own error if no connection can
    /// be opened.
    pub async fn acquire(&self, user_id: Uuid) -> Result<ConnectionHandle<D>> {
        let quota = self.policy.max_connections(user_id).await?;
        let pool = self.pools.get_or_create_pool(user_id, quota).await?;

        // A pool keeps the capacity it was opened with
        let limit = quota.min(pool.max_connections());
        let slot = self.slot(user_id);
        let lease_id = Uuid::new_v4();
        let acquired_at = Utc::now();

        {
            let mut state = slot.state.lock();
            state.limit = limit;
            if state.leases.len() >= limit as usize {
                let held = state.leases.len();
                drop(state);

                tracing::warn!(
                    %user_id,
                    held,
                    limit,
                    "Connection quota exceeded"
                );
                return Err(DatabaseError::QuotaExceeded {
                    user_id,
                    max_connections: limit,
                });
            }
            state.leases.insert(lease_id, acquired_at);
            state.peak = state.peak.max(state.leases.len());
        }

        let reservation = Reservation {
            slot: &slot,
            lease_id,
            armed: true,
        };

        let connection = match pool.checkout().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "Failed to check out connection");
                return Err(e);
            }
        };
        reservation.commit();

        tracing::debug!(%user_id, %lease_id, "Connection acquired");

        Ok(ConnectionHandle {
            lease_id,
            user_id,
            acquired_at,
            connection: Some(connection),
            pool,
        })
    }

    /// Check out a connection that is released automatically when the guard
    /// goes out of scope.
    pub async fn acquire_scoped(self: &Arc<Self>, user_id: Uuid) -> Result<ScopedConnection<D>> {
        let handle = self.acquire(user_id).await?;
        Ok(ScopedConnection::new(self.clone(), handle))
    }

    /// Return a connection to `user_id`'s pool.
    ///
    /// Fails with [`DatabaseError::NotFound`] when the handle is not checked
    /// out for that user, e.g. it was already released or belongs to someone
    /// else. The user's count is left untouched in that case.
    pub fn release(&self, user_id: Uuid, handle: &mut ConnectionHandle<D>) -> Result<()> {
        let lease_id = handle.lease_id;
        let slot = self
            .existing_slot(user_id)
            .filter(|slot| slot.state.lock().leases.contains_key(&lease_id));

        let Some(slot) = slot else {
            tracing::error!(
                %user_id,
                %lease_id,
                owner = %handle.user_id,
                "Release of a connection lease that is not checked out"
            );
            return Err(DatabaseError::not_found(
                "Connection lease",
                &lease_id.to_string(),
            ));
        };

        // The handle is borrowed exclusively, so nobody else can release this
        // lease between the check above and the removal below.
        if let Some(connection) = handle.connection.take() {
            handle.pool.checkin(connection);
        }
        slot.state.lock().leases.remove(&lease_id);

        tracing::debug!(%user_id, %lease_id, "Connection released");
        Ok(())
    }

    /// Number of leases currently held by `user_id`.
    pub fn checked_out(&self, user_id: Uuid) -> usize {
        self.existing_slot(user_id)
            .map(|slot| slot.state.lock().leases.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> RegistryStats {
        let slots: Vec<(Uuid, Arc<UserSlot>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let users: Vec<UserConnectionStats> = slots
            .into_iter()
            .map(|(user_id, slot)| {
                let pool = self.pools.get(user_id);
                let state = slot.state.lock();
                UserConnectionStats {
                    user_id,
                    max_connections: state.limit,
                    checked_out: state.leases.len(),
                    peak_checked_out: state.peak,
                    pool_created_at: pool.map(|p| p.created_at()),
                    oldest_lease_at: state.leases.values().min().copied(),
                }
            })
            .collect();

        RegistryStats {
            tracked_users: users.len(),
            open_pools: self.pools.pool_count(),
            checked_out: users.iter().map(|u| u.checked_out).sum(),
            users,
        }
    }

    /// Leases that have been checked out for at least `older_than`.
    pub fn stale_leases(&self, older_than: Duration) -> Vec<LeaseInfo> {
        let now = Utc::now();
        let slots: Vec<(Uuid, Arc<UserSlot>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut stale = Vec::new();
        for (user_id, slot) in slots {
            let state = slot.state.lock();
            for (lease_id, acquired_at) in state.leases.iter() {
                let held = now - *acquired_at;
                let is_stale = held
                    .to_std()
                    .map(|held| held >= older_than)
                    .unwrap_or(false);
                if is_stale {
                    stale.push(LeaseInfo {
                        lease_id: *lease_id,
                        user_id,
                        acquired_at: *acquired_at,
                        held_for_secs: held.num_seconds(),
                    });
                }
            }
        }

        stale.sort_by_key(|lease| lease.acquired_at);
        stale
    }

    /// Periodically log leases held longer than `threshold`.
    ///
    /// The task stops on its own once the registry is dropped.
    pub fn spawn_leak_monitor(
        self: &Arc<Self>,
        interval: Duration,
        threshold: Duration,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };

                for lease in registry.stale_leases(threshold) {
                    tracing::warn!(
                        user_id = %lease.user_id,
                        lease_id = %lease.lease_id,
                        held_for_secs = lease.held_for_secs,
                        "Connection lease held past leak threshold"
                    );
                }
            }
        })
    }

    /// Probe every open pool through the normal acquire/release path.
    ///
    /// A user already at its quota is reported as busy rather than being
    /// pushed past the limit. A pool whose user has since been removed or
    /// deactivated is reported as orphaned.
    pub async fn health_check(&self) -> Vec<PoolHealth> {
        let mut report = Vec::new();

        for user_id in self.pools.user_ids() {
            let (status, error) = match self.acquire(user_id).await {
                Ok(mut handle) => {
                    let ping = handle.ping().await;
                    if let Err(e) = self.release(user_id, &mut handle) {
                        tracing::error!(%user_id, error = %e, "Health check release failed");
                    }
                    match ping {
                        Ok(()) => (PoolStatus::Healthy, None),
                        Err(e) => (PoolStatus::Unhealthy, Some(e.to_string())),
                    }
                }
                Err(DatabaseError::QuotaExceeded { .. }) => (PoolStatus::Busy, None),
                Err(DatabaseError::UserNotFound(_)) => {
                    tracing::debug!(%user_id, "Pool belongs to a user without a quota");
                    (PoolStatus::Orphaned, None)
                }
                Err(e) => (PoolStatus::Unhealthy, Some(e.to_string())),
            };

            report.push(PoolHealth {
                user_id,
                status,
                error,
            });
        }

        report
    }

    /// Close and forget the pool of a user with no outstanding leases, so the
    /// next acquisition re-opens it sized to the user's current quota.
    ///
    /// Returns `false` when the user still holds leases or has no pool.
    pub async fn teardown_user(&self, user_id: Uuid) -> Result<bool> {
        let removed = match self.existing_slot(user_id) {
            Some(slot) => {
                let state = slot.state.lock();
                if !state.leases.is_empty() {
                    tracing::debug!(
                        %user_id,
                        held = state.leases.len(),
                        "Pool teardown skipped; leases outstanding"
                    );
                    None
                } else {
                    self.pools.remove(user_id)
                }
            }
            None => self.pools.remove(user_id),
        };

        let Some(pool) = removed else {
            return Ok(false);
        };
        pool.close().await;

        tracing::info!(%user_id, "Tore down connection pool for user");
        Ok(true)
    }

    /// Close every user pool.
    pub async fn shutdown(&self) {
        self.pools.close_all().await;
    }
}
