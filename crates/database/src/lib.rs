pub mod connection;
pub mod driver;
pub mod error;
pub mod guard;
pub mod pool_manager;
pub mod quota;
pub mod registry;
pub mod repositories;

pub use connection::{Database, DatabaseConfig};
pub use driver::{ConnectionDriver, PgDriver, PgDriverConfig};
pub use error::{DatabaseError, Result};
pub use guard::ScopedConnection;
pub use pool_manager::{PoolManager, UserPool};
pub use quota::{CachedQuotaPolicy, PgQuotaPolicy, QuotaPolicy, StaticQuotaPolicy};
pub use registry::{
    ConnectionHandle, ConnectionRegistry, LeaseInfo, PoolHealth, PoolStatus, RegistryConfig,
    RegistryStats, UserConnectionStats,
};
pub use repositories::users::UserRepository;
