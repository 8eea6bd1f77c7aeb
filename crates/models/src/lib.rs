// Core modules
pub mod user;

// Re-export commonly used types
pub use user::{normalize_quota, User, DEFAULT_MAX_CONNECTIONS};
