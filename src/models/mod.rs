//! Data models for the database router.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{
    ContextInfo, DatabaseType, PoolSpec, PoolSpecError, mask_password, validate_pool_name,
};
pub use query::{DEFAULT_STATEMENT_TIMEOUT_SECS, QueryParam, Row};
