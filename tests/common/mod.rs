//! In-memory backends shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use db_router::db::{BackendPool, Connection, ConnectionFactory, PoolStatus};
use db_router::error::{DbError, DbResult};
use db_router::models::{QueryParam, Row};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Counters for every connection a mock hands out.
#[derive(Default)]
pub struct ConnectionStats {
    pub opened: AtomicUsize,
    pub closes: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub statements: Mutex<Vec<String>>,
    pub fail_statements: AtomicBool,
    pub fail_commit: AtomicBool,
}

impl ConnectionStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

pub struct MockConnection {
    id: usize,
    stats: Arc<ConnectionStats>,
    auto_commit: bool,
    closed: bool,
}

impl MockConnection {
    pub fn new(stats: Arc<ConnectionStats>) -> Self {
        let id = stats.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            id,
            stats,
            auto_commit: true,
            closed: false,
        }
    }

    fn check(&mut self, sql: &str) -> DbResult<()> {
        if self.closed {
            return Err(DbError::connection("closed", "reconnect"));
        }
        self.stats.statements.lock().unwrap().push(sql.to_string());
        if self.stats.fail_statements.load(Ordering::SeqCst) {
            return Err(DbError::database("syntax error", Some("42000".to_string()), "Check the SQL"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<u64> {
        self.check(sql)?;
        Ok(1)
    }

    /// `SELECT NOTHING` returns no rows; anything else returns one row
    /// naming the connection that ran it.
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.check(sql)?;
        if sql == "SELECT NOTHING" {
            return Ok(Vec::new());
        }
        let mut row = Row::new();
        row.insert("connection".to_string(), json!(self.id));
        row.insert("params".to_string(), Value::from(params.len()));
        Ok(vec![row])
    }

    async fn set_auto_commit(&mut self, auto_commit: bool) -> DbResult<()> {
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        if self.stats.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::connection("commit lost", "retry"));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&mut self) -> DbResult<()> {
        Ok(())
    }

    async fn last_insert_id(&mut self) -> DbResult<Option<i64>> {
        Ok(if self.id > 1 { Some(self.id as i64) } else { None })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Backend pool whose availability can be toggled.
#[derive(Default)]
pub struct MockPool {
    pub stats: Arc<ConnectionStats>,
    pub down: AtomicBool,
    pub fail_evict: AtomicBool,
    pub acquires: AtomicUsize,
    pub disposes: AtomicUsize,
    pub evictions: AtomicUsize,
}

impl MockPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let pool = Self::new();
        pool.set_down(true);
        pool
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn disposes(&self) -> usize {
        self.disposes.load(Ordering::SeqCst)
    }

    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendPool for MockPool {
    async fn acquire(&self) -> DbResult<Box<dyn Connection>> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(DbError::connection("backend unreachable", "check the server"));
        }
        Ok(Box::new(MockConnection::new(Arc::clone(&self.stats))))
    }

    async fn dispose(&self) {
        self.disposes.fetch_add(1, Ordering::SeqCst);
    }

    async fn evict_idle(&self) -> DbResult<usize> {
        self.evictions.fetch_add(1, Ordering::SeqCst);
        if self.fail_evict.load(Ordering::SeqCst) {
            return Err(DbError::internal("eviction failed"));
        }
        Ok(0)
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            max_connections: 1,
            idle: 0,
            in_use: 0,
            generation: self.disposes() as u64,
        }
    }
}

/// Factory for building real `ConnectionPool`s over mock connections.
#[derive(Default)]
pub struct MockFactory {
    pub stats: Arc<ConnectionStats>,
    pub down: AtomicBool,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused", "start the server"));
        }
        Ok(Box::new(MockConnection::new(Arc::clone(&self.stats))))
    }

    fn describe(&self) -> String {
        "mock://backend".to_string()
    }
}
