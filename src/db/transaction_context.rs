//! Per-context connection holding and transaction scoping.
//!
//! Callers identify their logical unit of work with a [`ContextId`] and pass
//! it to every call. Nested `hold_connection` / `begin_transaction` scopes on
//! the same context share one physical connection; the connection goes back
//! to its pool when the last scope releases it, or when the transaction is
//! committed or rolled back.

use crate::db::connection::Connection;
use crate::db::router::Router;
use crate::error::{DbError, DbResult};
use crate::models::{ContextInfo, QueryParam, Row};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handle for one logical unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx_{}", self.0.simple())
    }
}

/// What `begin_transaction` and `hold_connection` do when no connection can
/// be acquired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LifecycleErrorPolicy {
    /// Log a warning and return `Ok(())` without creating a context.
    #[default]
    Swallow,
    /// Return the acquisition error.
    Propagate,
}

struct ContextEntry {
    connection: Option<Box<dyn Connection>>,
    auto_commit: bool,
    hold_count: u32,
    created_at: Instant,
}

impl ContextEntry {
    fn new(connection: Box<dyn Connection>, auto_commit: bool) -> Self {
        Self {
            connection: Some(connection),
            auto_commit,
            hold_count: 1,
            created_at: Instant::now(),
        }
    }
}

type SharedEntry = Arc<Mutex<ContextEntry>>;

/// Connection a statement runs on.
enum ResolvedConnection {
    Held(OwnedMutexGuard<ContextEntry>),
    Fresh(Box<dyn Connection>),
}

impl ResolvedConnection {
    fn connection(&mut self) -> DbResult<&mut (dyn Connection + 'static)> {
        match self {
            ResolvedConnection::Held(entry) => entry
                .connection
                .as_deref_mut()
                .ok_or_else(|| DbError::internal("Held connection already closed")),
            ResolvedConnection::Fresh(connection) => Ok(connection.as_mut()),
        }
    }

    /// Close a fresh connection; a held one stays with its context.
    async fn release(self) {
        if let ResolvedConnection::Fresh(mut connection) = self {
            connection.close().await;
        }
    }
}

/// Maps execution contexts to held connections.
pub struct TransactionManager {
    router: Arc<Router>,
    contexts: RwLock<HashMap<ContextId, SharedEntry>>,
    policy: LifecycleErrorPolicy,
    /// System start time for converting Instant to DateTime
    system_start_instant: Instant,
    system_start_datetime: DateTime<Utc>,
}

impl TransactionManager {
    pub fn new(router: Arc<Router>) -> Self {
        Self::with_policy(router, LifecycleErrorPolicy::default())
    }

    pub fn with_policy(router: Arc<Router>, policy: LifecycleErrorPolicy) -> Self {
        Self {
            router,
            contexts: RwLock::new(HashMap::new()),
            policy,
            system_start_instant: Instant::now(),
            system_start_datetime: Utc::now(),
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn policy(&self) -> LifecycleErrorPolicy {
        self.policy
    }

    async fn entry(&self, ctx: &ContextId) -> Option<SharedEntry> {
        self.contexts.read().await.get(ctx).cloned()
    }

    fn lifecycle_failure(&self, ctx: &ContextId, operation: &str, e: DbError) -> DbResult<()> {
        match self.policy {
            LifecycleErrorPolicy::Swallow => {
                warn!(context_id = %ctx, operation, error = %e, "Could not obtain connection");
                Ok(())
            }
            LifecycleErrorPolicy::Propagate => Err(e),
        }
    }

    /// Start (or join) a transaction on the context's connection.
    pub async fn begin_transaction(&self, ctx: &ContextId) -> DbResult<()> {
        if let Some(shared) = self.entry(ctx).await {
            let mut entry = shared.lock().await;
            let result = match entry.connection.as_mut() {
                Some(connection) => connection.set_auto_commit(false).await,
                None => Err(DbError::internal("Context connection already closed")),
            };
            if let Err(e) = result {
                return self.lifecycle_failure(ctx, "begin_transaction", e);
            }
            entry.auto_commit = false;
            entry.hold_count += 1;
            debug!(context_id = %ctx, hold_count = entry.hold_count, "Joined transaction");
            return Ok(());
        }

        let mut connection = match self.router.acquire().await {
            Ok(connection) => connection,
            Err(e) => return self.lifecycle_failure(ctx, "begin_transaction", e),
        };
        if let Err(e) = connection.set_auto_commit(false).await {
            connection.close().await;
            return self.lifecycle_failure(ctx, "begin_transaction", e);
        }

        self.insert(ctx, ContextEntry::new(connection, false)).await;
        info!(context_id = %ctx, "Transaction started");
        Ok(())
    }

    /// Keep one connection for the context until the matching release.
    pub async fn hold_connection(&self, ctx: &ContextId) -> DbResult<()> {
        if let Some(shared) = self.entry(ctx).await {
            let mut entry = shared.lock().await;
            entry.hold_count += 1;
            debug!(context_id = %ctx, hold_count = entry.hold_count, "Connection hold added");
            return Ok(());
        }

        let connection = match self.router.acquire().await {
            Ok(connection) => connection,
            Err(e) => return self.lifecycle_failure(ctx, "hold_connection", e),
        };

        self.insert(ctx, ContextEntry::new(connection, true)).await;
        debug!(context_id = %ctx, "Connection held");
        Ok(())
    }

    async fn insert(&self, ctx: &ContextId, entry: ContextEntry) {
        let previous = self
            .contexts
            .write()
            .await
            .insert(*ctx, Arc::new(Mutex::new(entry)));
        // Two first scopes raced; keep the newer connection
        if let Some(previous) = previous {
            warn!(context_id = %ctx, "Context registered twice, closing older connection");
            Self::close_entry(ctx, previous).await;
        }
    }

    /// Undo one `begin_transaction` or `hold_connection`.
    ///
    /// The last release commits an outstanding transaction and returns the
    /// connection.
    pub async fn release_connection(&self, ctx: &ContextId) -> DbResult<()> {
        let shared = self
            .entry(ctx)
            .await
            .ok_or_else(|| DbError::no_current_transaction("release connection"))?;

        let mut entry = shared.lock().await;
        entry.hold_count = entry.hold_count.saturating_sub(1);
        if entry.hold_count > 0 {
            debug!(context_id = %ctx, hold_count = entry.hold_count, "Connection hold released");
            return Ok(());
        }

        self.forget(ctx, &shared).await;
        let auto_commit = entry.auto_commit;
        let connection = entry.connection.take();
        drop(entry);

        if let Some(mut connection) = connection {
            if !auto_commit {
                if let Err(e) = connection.commit().await {
                    error!(context_id = %ctx, error = %e, "Commit on release failed");
                }
            }
            connection.close().await;
        }
        debug!(context_id = %ctx, "Connection released");
        Ok(())
    }

    /// Remove the map entry if it is still `shared`.
    async fn forget(&self, ctx: &ContextId, shared: &SharedEntry) {
        let mut contexts = self.contexts.write().await;
        if contexts.get(ctx).is_some_and(|e| Arc::ptr_eq(e, shared)) {
            contexts.remove(ctx);
        }
    }

    pub async fn commit_transaction(&self, ctx: &ContextId) -> DbResult<()> {
        self.finish_transaction(ctx, true).await
    }

    pub async fn rollback_transaction(&self, ctx: &ContextId) -> DbResult<()> {
        self.finish_transaction(ctx, false).await
    }

    /// Commit or roll back and drop the context, whatever holds remain.
    async fn finish_transaction(&self, ctx: &ContextId, commit: bool) -> DbResult<()> {
        let operation = if commit { "commit" } else { "rollback" };

        let shared = self
            .entry(ctx)
            .await
            .ok_or_else(|| DbError::no_current_transaction(operation))?;

        let mut entry = shared.lock().await;
        if entry.auto_commit {
            return Err(DbError::no_current_transaction(operation));
        }
        let Some(mut connection) = entry.connection.take() else {
            return Err(DbError::no_current_transaction(operation));
        };
        self.forget(ctx, &shared).await;
        let holds = entry.hold_count;
        drop(entry);

        let result = if commit {
            connection.commit().await
        } else {
            connection.rollback().await
        };
        if let Err(e) = result {
            error!(context_id = %ctx, operation, error = %e, "Transaction finish failed");
        }
        connection.close().await;

        info!(context_id = %ctx, operation, holds, "Transaction finished");
        Ok(())
    }

    async fn resolve(&self, ctx: &ContextId) -> DbResult<ResolvedConnection> {
        if let Some(shared) = self.entry(ctx).await {
            let entry = shared.lock_owned().await;
            if entry.connection.is_some() {
                return Ok(ResolvedConnection::Held(entry));
            }
        }
        Ok(ResolvedConnection::Fresh(self.router.acquire().await?))
    }

    fn statement_error(ctx: &ContextId, sql: &str, e: DbError) -> DbError {
        error!(
            context_id = %ctx,
            sql = %sql,
            retryable = e.is_retryable(),
            error = %e,
            "Statement failed"
        );
        DbError::statement(sql, e)
    }

    /// Run a statement and return the affected row count.
    pub async fn execute(&self, ctx: &ContextId, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let mut resolved = self
            .resolve(ctx)
            .await
            .map_err(|e| Self::statement_error(ctx, sql, e))?;
        let result = match resolved.connection() {
            Ok(connection) => connection.execute(sql, params).await,
            Err(e) => Err(e),
        };
        resolved.release().await;

        let rows_affected = result.map_err(|e| Self::statement_error(ctx, sql, e))?;
        debug!(context_id = %ctx, sql = %sql, rows_affected, "Executed statement");
        Ok(rows_affected)
    }

    /// Run a query and return every row.
    pub async fn query(&self, ctx: &ContextId, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let mut resolved = self
            .resolve(ctx)
            .await
            .map_err(|e| Self::statement_error(ctx, sql, e))?;
        let result = match resolved.connection() {
            Ok(connection) => connection.query(sql, params).await,
            Err(e) => Err(e),
        };
        resolved.release().await;

        let rows = result.map_err(|e| Self::statement_error(ctx, sql, e))?;
        debug!(context_id = %ctx, sql = %sql, rows = rows.len(), "Executed query");
        Ok(rows)
    }

    /// First row of the result, `None` when the query returns nothing.
    pub async fn query_optional(
        &self,
        ctx: &ContextId,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<Row>> {
        let rows = self.query(ctx, sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// First column of the first row.
    pub async fn query_scalar(
        &self,
        ctx: &ContextId,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<Value>> {
        let row = self.query_optional(ctx, sql, params).await?;
        Ok(row.and_then(|row| row.into_iter().next().map(|(_, value)| value)))
    }

    /// Last generated key on the context's held connection, 0 when none.
    pub async fn last_insert_id(&self, ctx: &ContextId) -> DbResult<i64> {
        let shared = self
            .entry(ctx)
            .await
            .ok_or_else(|| DbError::no_current_transaction("read last insert id"))?;
        let mut entry = shared.lock().await;
        let connection = entry
            .connection
            .as_mut()
            .ok_or_else(|| DbError::no_current_transaction("read last insert id"))?;
        Ok(connection.last_insert_id().await?.unwrap_or(0))
    }

    pub async fn is_connection_held(&self, ctx: &ContextId) -> bool {
        self.contexts.read().await.contains_key(ctx)
    }

    pub async fn is_in_transaction(&self, ctx: &ContextId) -> bool {
        match self.entry(ctx).await {
            Some(shared) => !shared.lock().await.auto_commit,
            None => false,
        }
    }

    /// Outstanding scopes on the context, 0 when it holds nothing.
    pub async fn hold_count(&self, ctx: &ContextId) -> u32 {
        match self.entry(ctx).await {
            Some(shared) => shared.lock().await.hold_count,
            None => 0,
        }
    }

    pub async fn context_count(&self) -> usize {
        self.contexts.read().await.len()
    }

    /// Metadata for every live context.
    pub async fn list_contexts(&self) -> Vec<ContextInfo> {
        let snapshot: Vec<(ContextId, SharedEntry)> = {
            let contexts = self.contexts.read().await;
            contexts.iter().map(|(id, e)| (*id, Arc::clone(e))).collect()
        }; // Lock released here

        let mut infos = Vec::with_capacity(snapshot.len());
        for (id, shared) in snapshot {
            let entry = shared.lock().await;
            // Convert Instant to DateTime by calculating offset from system start
            let offset_from_start = entry.created_at.duration_since(self.system_start_instant);
            infos.push(ContextInfo {
                context_id: id.to_string(),
                hold_count: entry.hold_count,
                auto_commit: entry.auto_commit,
                started_at: self.system_start_datetime + offset_from_start,
                age_secs: entry.created_at.elapsed().as_secs(),
            });
        }
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        infos
    }

    async fn close_entry(ctx: &ContextId, shared: SharedEntry) -> bool {
        let mut entry = shared.lock().await;
        match entry.connection.take() {
            Some(mut connection) => {
                connection.close().await;
                debug!(context_id = %ctx, "Closed context connection");
                true
            }
            None => false,
        }
    }

    /// Close every remaining context's connection. Returns how many were
    /// closed.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<(ContextId, SharedEntry)> =
            self.contexts.write().await.drain().collect(); // Lock released here

        let mut closed = 0;
        for (id, shared) in drained {
            if Self::close_entry(&id, shared).await {
                closed += 1;
            }
        }
        if closed > 0 {
            warn!(closed, "Closed connections still held at shutdown");
        }
        closed
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        if let Ok(contexts) = self.contexts.try_read() {
            if !contexts.is_empty() {
                warn!(
                    contexts = contexts.len(),
                    "TransactionManager dropped with live contexts - call shutdown()"
                );
            }
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_id_display() {
        let id = ContextId::new();
        let shown = id.to_string();
        assert!(shown.starts_with("ctx_"));
        assert_eq!(shown.len(), 4 + 32);
        assert_ne!(ContextId::new(), id);
    }

    #[test]
    fn test_default_policy_swallows() {
        assert_eq!(LifecycleErrorPolicy::default(), LifecycleErrorPolicy::Swallow);
    }

    #[tokio::test]
    async fn test_swallowed_begin_creates_no_context() {
        let manager = TransactionManager::new(Arc::new(Router::new()));
        let ctx = ContextId::new();

        manager.begin_transaction(&ctx).await.unwrap();
        assert!(!manager.is_connection_held(&ctx).await);
        assert_eq!(manager.hold_count(&ctx).await, 0);
    }

    #[tokio::test]
    async fn test_propagated_hold_failure() {
        let manager = TransactionManager::with_policy(
            Arc::new(Router::new()),
            LifecycleErrorPolicy::Propagate,
        );
        let ctx = ContextId::new();

        let result = manager.hold_connection(&ctx).await;
        assert!(matches!(result, Err(DbError::NoConnectionAvailable { .. })));
        assert_eq!(manager.context_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_without_context() {
        let manager = TransactionManager::new(Arc::new(Router::new()));
        let ctx = ContextId::new();

        let result = manager.release_connection(&ctx).await;
        assert!(matches!(result, Err(DbError::NoCurrentTransaction { .. })));
        let result = manager.commit_transaction(&ctx).await;
        assert!(matches!(result, Err(DbError::NoCurrentTransaction { .. })));
        let result = manager.last_insert_id(&ctx).await;
        assert!(matches!(result, Err(DbError::NoCurrentTransaction { .. })));
    }

    #[tokio::test]
    async fn test_statement_without_pools_is_wrapped() {
        let manager = TransactionManager::new(Arc::new(Router::new()));
        let ctx = ContextId::new();

        let result = manager.execute(&ctx, "DELETE FROM t", &[]).await;
        match result {
            Err(DbError::Statement { sql, source }) => {
                assert_eq!(sql, "DELETE FROM t");
                assert!(matches!(*source, DbError::NoConnectionAvailable { .. }));
            }
            other => panic!("expected Statement error, got {other:?}"),
        }
    }
}
