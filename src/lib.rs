//! Database router library.
//!
//! Spreads connection acquisition across named backend pools, quarantines
//! pools that fail and brings them back once they answer again. On top of
//! that, a [`TransactionManager`] lets nested scopes within one execution
//! context share a single connection or transaction.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{ContextId, Router, TransactionManager};
pub use error::{DbError, DbResult};
