//! Database dispatch macros for reducing code duplication.
//!
//! The backend connection is an enum over the three sqlx drivers. Most
//! operations are textually identical per driver but type-check against a
//! different connection type, so the arms are generated instead of written.

/// Run `$body` against whichever sqlx connection `$conn` holds.
///
/// # Example
///
/// ```ignore
/// dispatch_connection!(conn, c => sqlx::Connection::ping(c).await);
/// ```
macro_rules! dispatch_connection {
    ($conn:expr, $c:ident => $body:expr) => {
        match $conn {
            $crate::db::sqlx_backend::DbConnection::MySql($c) => $body,
            $crate::db::sqlx_backend::DbConnection::Postgres($c) => $body,
            $crate::db::sqlx_backend::DbConnection::SQLite($c) => $body,
        }
    };
}
