//! Backend pool contract and the default bounded pool.
//!
//! A [`BackendPool`] hands out connections to one backend. [`ConnectionPool`]
//! is the stock implementation: a semaphore caps the number of checked-out
//! connections, returned connections go to an idle list, and disposal bumps a
//! generation counter so connections checked out before it are closed on
//! return instead of being reused.

use crate::config::{
    DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
};
use crate::db::connection::{Connection, ConnectionFactory};
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Row};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Bounded set of connections to one backend.
#[async_trait]
pub trait BackendPool: Send + Sync {
    /// Check out a connection, waiting up to the pool's timeout when exhausted.
    async fn acquire(&self) -> DbResult<Box<dyn Connection>>;

    /// Close idle connections and invalidate checked-out ones. Idempotent.
    async fn dispose(&self);

    /// Close connections idle longer than the idle timeout. Returns how many
    /// were closed.
    async fn evict_idle(&self) -> DbResult<usize>;

    fn status(&self) -> PoolStatus;
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    pub max_connections: u32,
    pub idle: usize,
    pub in_use: usize,
    pub generation: u64,
}

/// Tuning for [`ConnectionPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// Ping idle connections before handing them out.
    pub test_before_acquire: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            test_before_acquire: true,
        }
    }
}

struct IdleConnection {
    connection: Box<dyn Connection>,
    generation: u64,
    since: Instant,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    settings: PoolSettings,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    generation: AtomicU64,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn checkout(self: &Arc<Self>) -> DbResult<PooledConnection> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| DbError::internal("Connection pool semaphore closed"))?;
        let generation = self.current_generation();

        loop {
            let candidate = self.idle().pop_back(); // Lock released here
            let Some(idle) = candidate else {
                break;
            };
            let mut connection = idle.connection;

            if idle.generation != generation {
                connection.close().await;
                continue;
            }
            if self.settings.test_before_acquire {
                if let Err(e) = connection.ping().await {
                    debug!(
                        factory = %self.factory.describe(),
                        error = %e,
                        "Idle connection failed ping, discarding"
                    );
                    connection.close().await;
                    continue;
                }
            }
            return Ok(PooledConnection::new(connection, Arc::clone(self), permit, generation));
        }

        let connection = self.factory.connect().await?;
        debug!(factory = %self.factory.describe(), "Opened new connection");
        Ok(PooledConnection::new(connection, Arc::clone(self), permit, generation))
    }

    /// Take a connection back. Stale or dirty connections are closed.
    async fn check_in(&self, mut connection: Box<dyn Connection>, generation: u64) {
        if generation != self.current_generation() {
            connection.close().await;
            return;
        }

        if !connection.auto_commit() {
            if let Err(e) = connection.rollback().await {
                warn!(error = %e, "Rollback on return failed, closing connection");
                connection.close().await;
                return;
            }
            if let Err(e) = connection.set_auto_commit(true).await {
                warn!(error = %e, "Restoring auto-commit failed, closing connection");
                connection.close().await;
                return;
            }
        }

        self.idle().push_back(IdleConnection {
            connection,
            generation,
            since: Instant::now(),
        });
    }
}

/// Semaphore-bounded pool over a [`ConnectionFactory`].
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, settings: PoolSettings) -> DbResult<Self> {
        if settings.max_connections == 0 {
            return Err(DbError::invalid_input(
                "max_connections must be greater than 0",
            ));
        }
        let permits = settings.max_connections as usize;
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                settings,
                semaphore: Arc::new(Semaphore::new(permits)),
                idle: Mutex::new(VecDeque::new()),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("factory", &self.inner.factory.describe())
            .field("settings", &self.inner.settings)
            .field("status", &self.status())
            .finish()
    }
}

#[async_trait]
impl BackendPool for ConnectionPool {
    async fn acquire(&self) -> DbResult<Box<dyn Connection>> {
        let timeout = self.inner.settings.acquire_timeout;
        match tokio::time::timeout(timeout, self.inner.checkout()).await {
            Ok(result) => result.map(|c| Box::new(c) as Box<dyn Connection>),
            Err(_) => Err(DbError::timeout(
                "connection pool acquire",
                timeout.as_secs().try_into().unwrap_or(u32::MAX),
            )),
        }
    }

    async fn dispose(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let drained: Vec<IdleConnection> = self.inner.idle().drain(..).collect(); // Lock released here

        let closed = drained.len();
        for idle in drained {
            let mut connection = idle.connection;
            connection.close().await;
        }
        info!(
            factory = %self.inner.factory.describe(),
            closed,
            generation,
            "Disposed connection pool"
        );
    }

    async fn evict_idle(&self) -> DbResult<usize> {
        let idle_timeout = self.inner.settings.idle_timeout;
        let generation = self.inner.current_generation();

        let expired: Vec<IdleConnection> = {
            let mut idle = self.inner.idle();
            let (expired, keep): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|c| c.generation != generation || c.since.elapsed() >= idle_timeout);
            idle.extend(keep);
            expired
        }; // Lock released here

        let evicted = expired.len();
        for idle in expired {
            let mut connection = idle.connection;
            connection.close().await;
        }
        if evicted > 0 {
            debug!(
                factory = %self.inner.factory.describe(),
                evicted,
                "Evicted idle connections"
            );
        }
        Ok(evicted)
    }

    fn status(&self) -> PoolStatus {
        let max_connections = self.inner.settings.max_connections;
        PoolStatus {
            max_connections,
            idle: self.inner.idle().len(),
            in_use: (max_connections as usize)
                .saturating_sub(self.inner.semaphore.available_permits()),
            generation: self.inner.current_generation(),
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// `close()` hands the connection back to its pool. Dropping it without
/// closing spawns a task that does the same.
pub struct PooledConnection {
    connection: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
    generation: u64,
}

impl PooledConnection {
    fn new(
        connection: Box<dyn Connection>,
        pool: Arc<PoolInner>,
        permit: OwnedSemaphorePermit,
        generation: u64,
    ) -> Self {
        Self {
            connection: Some(connection),
            pool,
            permit: Some(permit),
            generation,
        }
    }

    fn live(&mut self) -> DbResult<&mut Box<dyn Connection>> {
        self.connection.as_mut().ok_or_else(|| {
            DbError::connection(
                "Connection has been returned to its pool",
                "Acquire a new connection",
            )
        })
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.live()?.execute(sql, params).await
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.live()?.query(sql, params).await
    }

    async fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()> {
        self.live()?.set_auto_commit(auto_commit).await
    }

    fn auto_commit(&self) -> bool {
        self.connection.as_ref().is_none_or(|c| c.auto_commit())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.live()?.commit().await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.live()?.rollback().await
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.live()?.ping().await
    }

    async fn last_insert_id(&mut self) -> DbResult<Option<i64>> {
        self.live()?.last_insert_id().await
    }

    async fn close(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        self.pool.check_in(connection, self.generation).await;
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        // Spawn a task to handle async return - this is for cancellation safety
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let permit = self.permit.take();
        let generation = self.generation;
        handle.spawn(async move {
            pool.check_in(connection, generation).await;
            drop(permit);
            warn!("Connection returned via Drop - consider calling close()");
        });
    }
}
