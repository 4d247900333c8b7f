//! Per-database pool cache.
//!
//! Holds at most one live pool per physical database name. Pools are created on
//! first use, reused afterwards, and dropped on explicit eviction, on health
//! failure, after idling too long, or at shutdown.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per database key**: single-flight pool creation. Concurrent
//!   requests for the same unseen database wait for one construction; other
//!   databases are never blocked by it.
//! - **Lowercased keys**: SQL Server database names are case-insensitive, so
//!   `Orquidea` and `orquidea` share one pool.
//! - **`PoolHandle` as RAII guard**: holding a handle counts as in-flight work.
//!   The idle sweep skips entries with in-flight work and shutdown waits for the
//!   global count to reach zero.
//! - **Weak reference in the cleanup task**: the task exits once the cache is dropped.
//!
//! # Concurrency Safety
//!
//! - Locks are never held across pool creation or query execution
//! - Failed creations leave no initialized cell behind
//! - An entry is only closed under the map write lock after its state is set to
//!   `Closed`; acquirers register in-flight before reading the state, so either
//!   the sweep sees the acquirer or the acquirer sees `Closed` and retries

use crate::config::PoolOptions;
use crate::db::macros::Backend;
use crate::db::pool::{DbPool, PoolFactory};
use crate::error::{DbError, DbResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OnceCell, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health of a cached pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Healthy,
    /// A broken connection was observed; the next acquire replaces the pool.
    Degraded,
    /// Removed from the cache and closed.
    Closed,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PoolState::Healthy,
            1 => PoolState::Degraded,
            _ => PoolState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PoolState::Healthy => 0,
            PoolState::Degraded => 1,
            PoolState::Closed => 2,
        }
    }
}

/// Entry for one database pool.
pub struct PoolEntry {
    database: String,
    pool: DbPool,
    created_at: Instant,
    /// Uses std::sync::RwLock (not tokio) to avoid holding locks across await points.
    last_used_at: std::sync::RwLock<Instant>,
    state: AtomicU8,
    in_flight: AtomicUsize,
}

impl PoolEntry {
    fn new(database: &str, pool: DbPool) -> Self {
        let now = Instant::now();
        Self {
            database: database.to_string(),
            pool,
            created_at: now,
            last_used_at: std::sync::RwLock::new(now),
            state: AtomicU8::new(PoolState::Healthy.as_u8()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: PoolState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Healthy -> Degraded. A closed entry stays closed.
    pub fn mark_degraded(&self) {
        let _ = self.state.compare_exchange(
            PoolState::Healthy.as_u8(),
            PoolState::Degraded.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Mark the entry `Closed` unless work is in flight, in which case the prior
    /// state is put back. Returns whether the entry was retired.
    fn retire(&self) -> bool {
        let previous = self.state.swap(PoolState::Closed.as_u8(), Ordering::SeqCst);
        if self.in_flight() == 0 {
            return true;
        }
        let _ = self.state.compare_exchange(
            PoolState::Closed.as_u8(),
            previous,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        false
    }

    fn touch(&self) {
        if let Ok(mut last_used_at) = self.last_used_at.write() {
            *last_used_at = Instant::now();
        }
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
            .read()
            .map(|guard| *guard)
            .unwrap_or(self.created_at)
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("database", &self.database)
            .field("pool", &self.pool)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Process-wide in-flight accounting used by the shutdown drain.
#[derive(Debug, Default)]
struct DrainState {
    closing: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl DrainState {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// A checked-out pool. Dropping the handle releases its in-flight slot.
pub struct PoolHandle {
    entry: Arc<PoolEntry>,
    drain: Arc<DrainState>,
}

impl PoolHandle {
    fn new(entry: Arc<PoolEntry>, drain: Arc<DrainState>) -> Self {
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        drain.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { entry, drain }
    }

    pub fn database(&self) -> &str {
        &self.entry.database
    }

    pub fn pool(&self) -> &DbPool {
        &self.entry.pool
    }

    pub fn backend(&self) -> Backend {
        self.entry.pool.backend()
    }

    pub fn state(&self) -> PoolState {
        self.entry.state()
    }

    /// Report a broken connection; the cache replaces the pool on the next acquire.
    pub fn mark_degraded(&self) {
        if self.entry.state() == PoolState::Healthy {
            warn!(database = %self.entry.database, "Marking pool degraded");
        }
        self.entry.mark_degraded();
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.drain.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drain.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("database", &self.entry.database)
            .field("state", &self.entry.state())
            .finish_non_exhaustive()
    }
}

/// Snapshot of one cached pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub database: String,
    pub backend: String,
    pub state: PoolState,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub in_flight: usize,
    pub open_connections: u32,
    pub idle_connections: u32,
}

/// Idle sweep configuration.
#[derive(Debug, Clone)]
pub struct PoolCacheConfig {
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl From<&PoolOptions> for PoolCacheConfig {
    fn from(opts: &PoolOptions) -> Self {
        Self {
            idle_timeout: opts.database_pool_idle_timeout_or_default(),
            cleanup_interval: opts.database_pool_cleanup_interval_or_default(),
        }
    }
}

type PoolCell = Arc<OnceCell<Arc<PoolEntry>>>;

/// Concurrency-safe map of database name to pool.
pub struct PoolCache {
    factory: Arc<dyn PoolFactory>,
    config: PoolCacheConfig,
    /// Per-database lazy pools. OnceCell ensures single-flight creation.
    pools: TokioRwLock<HashMap<String, PoolCell>>,
    drain: Arc<DrainState>,
    /// Cleanup task handle. Uses std::sync::Mutex for synchronous storage.
    cleanup_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PoolCache {
    /// Create a new pool cache.
    ///
    /// Spawns a background task that periodically closes idle pools.
    pub fn new(factory: Arc<dyn PoolFactory>, config: PoolCacheConfig) -> Arc<Self> {
        let cache = Arc::new(Self {
            factory,
            config,
            pools: TokioRwLock::new(HashMap::new()),
            drain: Arc::new(DrainState::default()),
            cleanup_handle: std::sync::Mutex::new(None),
        });

        let weak_cache = Arc::downgrade(&cache);
        let cleanup_interval = cache.config.cleanup_interval;
        let idle_timeout = cache.config.idle_timeout;

        let handle = tokio::spawn(async move {
            Self::cleanup_task(weak_cache, cleanup_interval, idle_timeout).await;
        });

        if let Ok(mut guard) = cache.cleanup_handle.lock() {
            *guard = Some(handle);
        }

        cache
    }

    pub fn backend(&self) -> Backend {
        self.factory.backend()
    }

    /// Get or create the pool for `database`.
    pub async fn acquire(&self, database: &str) -> DbResult<PoolHandle> {
        let database = database.trim();
        if database.is_empty() {
            return Err(DbError::invalid_input("database name cannot be empty"));
        }
        let key = database.to_lowercase();

        loop {
            if self.drain.is_closing() {
                return Err(DbError::ShutDown);
            }

            let cell = self.cell_for(&key).await;
            let result = cell
                .get_or_try_init(|| async {
                    info!(database = %database, backend = %self.factory.backend(), "Creating database pool");
                    let pool = self.factory.create(database).await?;
                    Ok::<_, DbError>(Arc::new(PoolEntry::new(database, pool)))
                })
                .await;

            let entry = match result {
                Ok(entry) => Arc::clone(entry),
                Err(e) => {
                    warn!(database = %database, error = %e, "Database pool creation failed");
                    self.discard_failed(&key, &cell).await;
                    return Err(e);
                }
            };

            // Register before reading the state, see module docs
            let handle = PoolHandle::new(entry, Arc::clone(&self.drain));

            match handle.state() {
                PoolState::Healthy => {}
                PoolState::Degraded => {
                    drop(handle);
                    self.replace_degraded(&key, &cell).await;
                    continue;
                }
                PoolState::Closed => {
                    // Being removed right now; the next lookup waits for the write lock
                    drop(handle);
                    continue;
                }
            }

            if self.drain.is_closing() {
                // Created while shutting down: close_all may have missed it
                handle.pool().close().await;
                return Err(DbError::ShutDown);
            }

            handle.entry.touch();
            debug!(database = %database, "Returning database pool");
            return Ok(handle);
        }
    }

    /// Get the cell for `key`, inserting an empty one if needed.
    async fn cell_for(&self, key: &str) -> PoolCell {
        {
            let pools = self.pools.read().await;
            if let Some(cell) = pools.get(key) {
                return Arc::clone(cell);
            }
        }
        let mut pools = self.pools.write().await;
        // Double-check after acquiring write lock
        Arc::clone(
            pools
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Drop a cell whose creation failed, unless another caller is still waiting on it.
    async fn discard_failed(&self, key: &str, cell: &PoolCell) {
        let mut pools = self.pools.write().await;
        if let Some(current) = pools.get(key) {
            // map + our clone
            if Arc::ptr_eq(current, cell) && current.get().is_none() && Arc::strong_count(cell) == 2
            {
                pools.remove(key);
            }
        }
    }

    /// Remove a degraded entry (if still current) and close it in the background.
    async fn replace_degraded(&self, key: &str, cell: &PoolCell) {
        let removed = {
            let mut pools = self.pools.write().await;
            match pools.get(key) {
                Some(current) if Arc::ptr_eq(current, cell) => pools.remove(key),
                _ => None,
            }
        };

        if let Some(entry) = removed.as_ref().and_then(|cell| cell.get()) {
            info!(database = %entry.database, "Replacing degraded database pool");
            entry.set_state(PoolState::Closed);
            let entry = Arc::clone(entry);
            tokio::spawn(async move {
                entry.pool.close().await;
            });
        }
    }

    /// Close and remove the pool for `database`. Returns whether a pool existed.
    pub async fn evict(&self, database: &str) -> bool {
        let key = database.trim().to_lowercase();
        let removed = {
            let mut pools = self.pools.write().await;
            let removed = pools.remove(&key);
            if let Some(entry) = removed.as_ref().and_then(|cell| cell.get()) {
                entry.set_state(PoolState::Closed);
            }
            removed
        };

        match removed.as_ref().and_then(|cell| cell.get()) {
            Some(entry) => {
                info!(database = %entry.database, "Evicting database pool");
                entry.pool.close().await;
                true
            }
            None => false,
        }
    }

    /// Stop accepting new work. In-flight handles stay valid.
    pub fn begin_shutdown(&self) {
        self.drain.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.drain.is_closing()
    }

    /// Number of checked-out handles across all pools.
    pub fn in_flight(&self) -> usize {
        self.drain.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no handle is checked out. Returns false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drain.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    /// Close all database pools and cancel the cleanup task.
    ///
    /// Further `acquire` calls fail with [`DbError::ShutDown`].
    pub async fn close_all(&self) {
        self.begin_shutdown();

        if let Ok(mut handle_guard) = self.cleanup_handle.lock() {
            if let Some(handle) = handle_guard.take() {
                handle.abort();
            }
        }

        // Drain pools under lock, close outside lock
        let pools_to_close: Vec<_> = {
            let mut pools = self.pools.write().await;
            pools.drain().collect()
        };

        for (key, cell) in pools_to_close {
            if let Some(entry) = cell.get() {
                info!(database = %key, in_flight = entry.in_flight(), "Closing database pool");
                entry.set_state(PoolState::Closed);
                entry.pool.close().await;
            }
        }
    }

    /// Get the number of live pools (initialized cells).
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|cell| cell.get().is_some()).count()
    }

    /// Snapshot of every live pool, sorted by database name.
    pub async fn stats(&self) -> Vec<PoolSummary> {
        let now = Instant::now();
        let pools = self.pools.read().await;
        let mut summaries: Vec<PoolSummary> = pools
            .values()
            .filter_map(|cell| cell.get())
            .map(|entry| {
                let (open, idle) = entry.pool.connection_counts();
                PoolSummary {
                    database: entry.database.clone(),
                    backend: entry.pool.backend().to_string(),
                    state: entry.state(),
                    age_secs: now.saturating_duration_since(entry.created_at).as_secs(),
                    idle_secs: now.saturating_duration_since(entry.last_used_at()).as_secs(),
                    in_flight: entry.in_flight(),
                    open_connections: open,
                    idle_connections: idle,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.database.cmp(&b.database));
        summaries
    }

    /// Background task to close idle pools.
    ///
    /// Uses collect-then-act:
    /// 1. Collect candidates with a read lock
    /// 2. Re-check and remove each one under a brief write lock
    /// 3. Close pools outside of all locks
    async fn cleanup_task(weak_cache: Weak<Self>, cleanup_interval: Duration, idle_timeout: Duration) {
        let mut interval = tokio::time::interval(cleanup_interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(cache) = weak_cache.upgrade() else {
                debug!("Pool cache dropped, cleanup task exiting");
                return;
            };
            cache.sweep_idle(idle_timeout).await;
            // Drop strong reference before sleeping to allow deallocation
            drop(cache);
        }
    }

    /// Close pools idle longer than `idle_timeout`. Returns how many were closed.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let candidates: Vec<String> = {
            let pools = self.pools.read().await;
            pools
                .iter()
                .filter(|(_, cell)| match cell.get() {
                    Some(entry) => {
                        entry.in_flight() == 0
                            && now.saturating_duration_since(entry.last_used_at()) > idle_timeout
                    }
                    // Left behind by a failed creation nobody is waiting on
                    None => Arc::strong_count(cell) == 1,
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut closed = 0;
        for key in candidates {
            let removed = {
                let mut pools = self.pools.write().await;
                let Some(cell) = pools.get(&key) else {
                    continue;
                };
                match cell.get() {
                    Some(entry) => {
                        // Re-check after acquiring write lock
                        if now.saturating_duration_since(entry.last_used_at()) <= idle_timeout {
                            continue;
                        }
                        if !entry.retire() {
                            debug!(database = %key, "Pool became active during cleanup, skipping");
                            continue;
                        }
                    }
                    None if Arc::strong_count(cell) > 1 => continue,
                    None => {}
                }
                pools.remove(&key)
            };

            if let Some(entry) = removed.as_ref().and_then(|cell| cell.get()) {
                info!(database = %key, "Closing idle database pool");
                entry.pool.close().await;
                closed += 1;
            }
        }
        closed
    }
}

impl Drop for PoolCache {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.cleanup_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for PoolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCache")
            .field("factory", &self.factory)
            .field("idle_timeout", &self.config.idle_timeout)
            .field("closing", &self.drain.is_closing())
            .finish()
    }
}
