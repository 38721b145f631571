//! Load-balancing, failure-quarantining connection router.
//!
//! A [`Router`] spreads acquisition across named backend pools. Each attempt
//! picks an active pool uniformly at random; a pool that fails to hand out a
//! connection is moved to quarantine and disposed. Maintenance probes
//! quarantined pools and moves the ones that answer back into rotation, then
//! evicts idle connections from the healthy ones.
//!
//! The active and quarantine lists share one mutex that is only held for list
//! bookkeeping. Acquire, probe, dispose and evict run outside it.

use crate::db::connection::{Connection, ConnectionFactory};
use crate::db::pool::{BackendPool, ConnectionPool, PoolSettings, PoolStatus};
use crate::error::{DbError, DbResult};
use crate::models::validate_pool_name;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Acquisition attempts before giving up.
pub const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Period of scheduled maintenance.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration =
    Duration::from_secs(crate::config::DEFAULT_MAINTENANCE_INTERVAL_SECS);

/// How long `stop_maintenance` waits for the task before aborting it.
pub const MAINTENANCE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A backend pool registered under a name. Equality is by name.
#[derive(Clone)]
pub struct NamedPool {
    name: String,
    pool: Arc<dyn BackendPool>,
}

impl NamedPool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<dyn BackendPool> {
        &self.pool
    }

    /// Same registration, not merely the same name.
    fn is_same(&self, other: &NamedPool) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.pool, &other.pool)
    }
}

impl PartialEq for NamedPool {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for NamedPool {}

impl std::fmt::Debug for NamedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedPool")
            .field("name", &self.name)
            .field("status", &self.pool.status())
            .finish()
    }
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MaintenanceReport {
    /// Pools moved from quarantine back to active.
    pub resurrected: Vec<String>,
    /// Pools whose probe failed.
    pub still_quarantined: Vec<String>,
    /// Active pools whose idle eviction ran cleanly.
    pub evicted_pools: Vec<String>,
    /// Idle connections closed across all active pools.
    pub evicted_connections: usize,
}

/// Name and counters of one registered pool.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolSummary {
    pub name: String,
    pub status: PoolStatus,
}

struct RouterState {
    active: Vec<NamedPool>,
    quarantined: Vec<NamedPool>,
    rng: StdRng,
}

impl RouterState {
    fn contains(&self, name: &str) -> bool {
        self.active.iter().any(|p| p.name == name)
            || self.quarantined.iter().any(|p| p.name == name)
    }

    /// Move `candidate` from active to quarantine. False when another caller
    /// already moved or removed it.
    fn quarantine(&mut self, candidate: &NamedPool) -> bool {
        match self.active.iter().position(|p| p.is_same(candidate)) {
            Some(idx) => {
                let pool = self.active.remove(idx);
                self.quarantined.push(pool);
                true
            }
            None => false,
        }
    }

    fn restore(&mut self, candidate: &NamedPool) -> bool {
        match self.quarantined.iter().position(|p| p.is_same(candidate)) {
            Some(idx) => {
                let pool = self.quarantined.remove(idx);
                self.active.push(pool);
                true
            }
            None => false,
        }
    }
}

struct MaintenanceTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Router {
    state: Mutex<RouterState>,
    /// Scheduled maintenance handle. Uses std::sync::Mutex for synchronous storage.
    maintenance: std::sync::Mutex<Option<MaintenanceTask>>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Router with a deterministic pool selection sequence.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            state: Mutex::new(RouterState {
                active: Vec::new(),
                quarantined: Vec::new(),
                rng,
            }),
            maintenance: std::sync::Mutex::new(None),
        }
    }

    /// Register a backend by building a [`ConnectionPool`] over `factory`.
    ///
    /// `timeout` bounds how long an acquisition waits on an exhausted pool
    /// (default 60 seconds).
    pub async fn add_pool(
        &self,
        name: &str,
        factory: Arc<dyn ConnectionFactory>,
        max_connections: u32,
        timeout: Option<Duration>,
    ) -> DbResult<()> {
        let defaults = PoolSettings::default();
        let settings = PoolSettings {
            max_connections,
            acquire_timeout: timeout.unwrap_or(defaults.acquire_timeout),
            ..defaults
        };
        self.add_pool_with_settings(name, factory, settings).await
    }

    pub async fn add_pool_with_settings(
        &self,
        name: &str,
        factory: Arc<dyn ConnectionFactory>,
        settings: PoolSettings,
    ) -> DbResult<()> {
        let pool = ConnectionPool::new(factory, settings)?;
        self.add_backend(name, Arc::new(pool)).await
    }

    /// Register a custom [`BackendPool`] implementation.
    pub async fn add_backend(&self, name: &str, pool: Arc<dyn BackendPool>) -> DbResult<()> {
        validate_pool_name(name).map_err(|e| DbError::invalid_input(e.to_string()))?;

        {
            let mut state = self.state.lock().await;
            if state.contains(name) {
                return Err(DbError::invalid_input(format!(
                    "Pool '{}' is already registered",
                    name
                )));
            }
            state.active.push(NamedPool {
                name: name.to_string(),
                pool,
            });
        } // Lock released here

        info!(pool = %name, "Pool added");
        Ok(())
    }

    /// Remove a pool from rotation and dispose it.
    ///
    /// Names that are unknown or only quarantined are left alone.
    pub async fn remove_pool(&self, name: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            state
                .active
                .iter()
                .position(|p| p.name == name)
                .map(|idx| state.active.remove(idx))
        }; // Lock released here

        match removed {
            Some(pool) => {
                pool.pool.dispose().await;
                info!(pool = %name, "Pool removed");
            }
            None => debug!(pool = %name, "Pool not active, nothing to remove"),
        }
    }

    /// Get a connection from a randomly chosen active pool.
    ///
    /// Makes up to [`MAX_ACQUIRE_ATTEMPTS`] attempts. A pool that fails is
    /// quarantined and disposed before the next attempt.
    pub async fn acquire(&self) -> DbResult<Box<dyn Connection>> {
        let mut last_error = None;
        let mut failures = 0;

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let candidate = {
                let mut state = self.state.lock().await;
                if state.active.is_empty() {
                    break;
                }
                let len = state.active.len();
                let idx = state.rng.gen_range(0..len);
                state.active[idx].clone()
            }; // Lock released here

            match candidate.pool.acquire().await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(
                        pool = %candidate.name,
                        attempt,
                        error = %e,
                        "Acquire failed, quarantining pool"
                    );
                    let moved = self.state.lock().await.quarantine(&candidate);
                    if moved {
                        candidate.pool.dispose().await;
                    }
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        let message = match &last_error {
            Some(_) => format!("{} acquisition attempts failed", failures),
            None => "no active pools".to_string(),
        };
        Err(DbError::no_connection_available(message, last_error))
    }

    /// Probe quarantined pools and evict idle connections from active ones.
    ///
    /// Every active pool is visited even when one eviction fails; the first
    /// eviction error is returned after the pass.
    pub async fn run_maintenance(&self) -> DbResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        let quarantined = self.state.lock().await.quarantined.clone();
        for candidate in quarantined {
            match candidate.pool.acquire().await {
                Ok(mut probe) => {
                    probe.close().await;
                    if self.state.lock().await.restore(&candidate) {
                        info!(pool = %candidate.name, "Pool recovered, back in rotation");
                        report.resurrected.push(candidate.name.clone());
                    }
                }
                Err(e) => {
                    debug!(pool = %candidate.name, error = %e, "Pool still unavailable");
                    report.still_quarantined.push(candidate.name.clone());
                }
            }
        }

        let active = self.state.lock().await.active.clone();
        let mut first_error = None;
        for pool in active {
            match pool.pool.evict_idle().await {
                Ok(evicted) => {
                    report.evicted_connections += evicted;
                    report.evicted_pools.push(pool.name.clone());
                }
                Err(e) => {
                    warn!(pool = %pool.name, error = %e, "Idle eviction failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(
            resurrected = report.resurrected.len(),
            still_quarantined = report.still_quarantined.len(),
            evicted_connections = report.evicted_connections,
            "Maintenance pass complete"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Names of pools currently in rotation.
    pub async fn active_pools(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.active.iter().map(|p| p.name.clone()).collect()
    }

    /// Names of pools currently quarantined.
    pub async fn quarantined_pools(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.quarantined.iter().map(|p| p.name.clone()).collect()
    }

    /// Counters for every registered pool, active first.
    pub async fn pool_summaries(&self) -> Vec<PoolSummary> {
        let state = self.state.lock().await;
        state
            .active
            .iter()
            .chain(state.quarantined.iter())
            .map(|p| PoolSummary {
                name: p.name.clone(),
                status: p.pool.status(),
            })
            .collect()
    }

    fn maintenance_slot(&self) -> std::sync::MutexGuard<'_, Option<MaintenanceTask>> {
        self.maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance_slot()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Run maintenance now and then every `period` on a background task.
    ///
    /// The task holds a weak reference and exits once the router is dropped.
    /// A zero `period` is rejected.
    pub fn start_maintenance(self: &Arc<Self>, period: Duration) -> DbResult<()> {
        if period.is_zero() {
            return Err(DbError::invalid_input(
                "maintenance period must be greater than 0",
            ));
        }

        let mut slot = self.maintenance_slot();
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            debug!("Maintenance already running");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let weak_router = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            Self::maintenance_task(weak_router, period, shutdown_rx).await;
        });
        *slot = Some(MaintenanceTask {
            shutdown: shutdown_tx,
            handle,
        });

        info!(period_secs = period.as_secs(), "Scheduled maintenance started");
        Ok(())
    }

    /// Stop scheduled maintenance, interrupting a pass in progress.
    ///
    /// Waits up to [`MAINTENANCE_STOP_TIMEOUT`], then aborts the task.
    pub async fn stop_maintenance(&self) {
        let task = self.maintenance_slot().take(); // Lock released here
        let Some(task) = task else {
            return;
        };

        let _ = task.shutdown.send(());
        let abort = task.handle.abort_handle();
        match tokio::time::timeout(MAINTENANCE_STOP_TIMEOUT, task.handle).await {
            Ok(Ok(())) => info!("Scheduled maintenance stopped"),
            Ok(Err(e)) => warn!(error = %e, "Maintenance task ended abnormally"),
            Err(_) => {
                abort.abort();
                warn!(
                    timeout_secs = MAINTENANCE_STOP_TIMEOUT.as_secs(),
                    "Maintenance task did not stop in time, aborted"
                );
            }
        }
    }

    /// Stop maintenance and dispose every pool, active and quarantined.
    pub async fn shutdown(&self) {
        self.stop_maintenance().await;

        let pools: Vec<NamedPool> = {
            let mut state = self.state.lock().await;
            let mut pools: Vec<NamedPool> = state.active.drain(..).collect();
            pools.append(&mut state.quarantined);
            pools
        }; // Lock released here

        for pool in &pools {
            pool.pool.dispose().await;
        }
        info!(pools = pools.len(), "Router shut down");
    }

    async fn maintenance_task(
        weak_router: Weak<Self>,
        period: Duration,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Maintenance task received shutdown signal");
                    return;
                }
                _ = interval.tick() => {}
            }

            // Try to upgrade weak reference - exit if router was dropped
            let Some(router) = weak_router.upgrade() else {
                info!("Router dropped, maintenance task exiting");
                return;
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Maintenance pass interrupted by shutdown");
                    return;
                }
                result = router.run_maintenance() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Scheduled maintenance reported an error");
                    }
                }
            }

            // Drop strong reference before sleeping to allow router deallocation
            drop(router);
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("maintenance_running", &self.is_maintenance_running())
            .finish_non_exhaustive()
    }
}
