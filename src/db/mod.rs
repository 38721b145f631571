//! Database access layer.
//!
//! - Backend connection and pool contracts, with a semaphore-bounded pool
//! - sqlx-backed MySQL, PostgreSQL and SQLite connections
//! - The load-balancing, quarantining router
//! - Per-context connection holding and transactions
//! - Shard-indexed router collections

pub mod connection;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod router;
pub mod shard;
pub mod sqlx_backend;
pub mod transaction_context;
pub mod types;

pub use connection::{Connection, ConnectionFactory};
pub use pool::{BackendPool, ConnectionPool, PoolSettings, PoolStatus, PooledConnection};
pub use router::{MaintenanceReport, NamedPool, PoolSummary, Router};
pub use shard::{ArrayShardedSource, MaintenanceSummary, MapShardedSource, ShardedSource};
pub use sqlx_backend::{SqlxConnection, SqlxConnector};
pub use transaction_context::{ContextId, LifecycleErrorPolicy, TransactionManager};
