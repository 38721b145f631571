//! Backend connection contracts.
//!
//! A [`Connection`] is one exclusively owned session with a backend. A
//! [`ConnectionFactory`] opens new sessions; pools built on top of it decide
//! when to open and when to reuse.

use crate::error::DbResult;
use crate::models::{QueryParam, Row};
use async_trait::async_trait;

/// One session with a database backend.
///
/// Auto-commit starts on. With auto-commit off, statements run inside a
/// transaction that stays open until [`commit`](Connection::commit) or
/// [`rollback`](Connection::rollback). Turning auto-commit back on while a
/// transaction is open commits it.
#[async_trait]
pub trait Connection: Send {
    /// Run a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    /// Run a query and decode every row.
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;

    async fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()>;

    fn auto_commit(&self) -> bool;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Cheap liveness check.
    async fn ping(&mut self) -> DbResult<()>;

    /// Last key generated in this session, `None` when the backend has none.
    async fn last_insert_id(&mut self) -> DbResult<Option<i64>>;

    /// Release the session. Never fails; calling it twice is a no-op and any
    /// later statement returns a connection error.
    async fn close(&mut self);
}

/// Opens new backend sessions.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> DbResult<Box<dyn Connection>>;

    /// Credential-free description for logs.
    fn describe(&self) -> String {
        "connection factory".to_string()
    }
}

