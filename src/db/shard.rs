//! Shard-indexed collections of routers.
//!
//! [`ArrayShardedSource`] has a fixed number of shards numbered `0..n`;
//! [`MapShardedSource`] registers shards sparsely by number.

use crate::db::router::Router;
use crate::error::DbError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Index;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Per-shard outcome of a maintenance fan-out.
#[derive(Debug, Default)]
pub struct MaintenanceSummary {
    pub succeeded: Vec<usize>,
    pub failed: Vec<(usize, DbError)>,
}

impl MaintenanceSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Routers addressed by shard number.
#[async_trait]
pub trait ShardedSource: Send + Sync {
    /// Router for `shard`.
    fn source_for(&self, shard: usize) -> Option<Arc<Router>>;

    fn shard_count(&self) -> usize;

    /// Every registered shard with its router, ascending.
    fn routers(&self) -> Vec<(usize, Arc<Router>)>;

    /// Run maintenance on every shard in ascending order.
    ///
    /// A failing shard is logged and recorded; the remaining shards still run.
    async fn run_maintenance_job(&self) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::default();
        for (shard, router) in self.routers() {
            match router.run_maintenance().await {
                Ok(_) => summary.succeeded.push(shard),
                Err(e) => {
                    warn!(shard, error = %e, "Shard maintenance failed");
                    summary.failed.push((shard, e));
                }
            }
        }
        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            "Shard maintenance job finished"
        );
        summary
    }

    /// Start scheduled maintenance on every shard. A zero `period` fails
    /// before any router is started.
    fn start_maintenance(&self, period: Duration) -> Result<(), DbError> {
        for (_, router) in self.routers() {
            router.start_maintenance(period)?;
        }
        Ok(())
    }

    async fn stop_maintenance(&self) {
        for (_, router) in self.routers() {
            router.stop_maintenance().await;
        }
    }

    /// Stop maintenance and dispose every pool on every shard.
    async fn shutdown(&self) {
        for (_, router) in self.routers() {
            router.shutdown().await;
        }
    }
}

/// Fixed set of shards `0..n`.
#[derive(Debug)]
pub struct ArrayShardedSource {
    shards: Vec<Arc<Router>>,
}

impl ArrayShardedSource {
    pub fn new(routers: Vec<Arc<Router>>) -> Self {
        Self { shards: routers }
    }

    /// `count` shards, each with an empty router.
    pub fn with_shard_count(count: usize) -> Self {
        Self::new((0..count).map(|_| Arc::new(Router::new())).collect())
    }

    /// Non-panicking lookup.
    pub fn get(&self, shard: usize) -> Option<&Arc<Router>> {
        self.shards.get(shard)
    }
}

impl Index<usize> for ArrayShardedSource {
    type Output = Arc<Router>;

    fn index(&self, shard: usize) -> &Self::Output {
        match self.shards.get(shard) {
            Some(router) => router,
            None => panic!(
                "shard {} out of range, source has {} shards",
                shard,
                self.shards.len()
            ),
        }
    }
}

#[async_trait]
impl ShardedSource for ArrayShardedSource {
    /// # Panics
    ///
    /// When `shard` is not below [`shard_count`](ShardedSource::shard_count).
    fn source_for(&self, shard: usize) -> Option<Arc<Router>> {
        Some(Arc::clone(&self[shard]))
    }

    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn routers(&self) -> Vec<(usize, Arc<Router>)> {
        self.shards.iter().cloned().enumerate().collect()
    }
}

/// Sparse shards registered by number.
#[derive(Debug, Default)]
pub struct MapShardedSource {
    shards: std::sync::RwLock<BTreeMap<usize, Arc<Router>>>,
}

impl MapShardedSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<usize, Arc<Router>>> {
        self.shards
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register `router` as `shard`, returning the router it replaced.
    pub fn insert(&self, shard: usize, router: Arc<Router>) -> Option<Arc<Router>> {
        self.shards
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(shard, router)
    }

    pub fn remove(&self, shard: usize) -> Option<Arc<Router>> {
        self.shards
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&shard)
    }
}

#[async_trait]
impl ShardedSource for MapShardedSource {
    fn source_for(&self, shard: usize) -> Option<Arc<Router>> {
        self.read().get(&shard).cloned()
    }

    fn shard_count(&self) -> usize {
        self.read().len()
    }

    fn routers(&self) -> Vec<(usize, Arc<Router>)> {
        self.read()
            .iter()
            .map(|(shard, router)| (*shard, Arc::clone(router)))
            .collect()
    }
}
