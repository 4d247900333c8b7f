//! Shared fixtures: seeded SQLite tenant databases and a counting pool factory.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tenant_db::config::PoolOptions;
use tenant_db::db::{Backend, DbPool, PoolCache, PoolCacheConfig, PoolFactory, SqlitePoolFactory};
use tenant_db::{ConnectionSettings, DatabaseManager, DbResult};
use tempfile::TempDir;

pub const MASTER_DB: &str = "erp_master";

/// Create `<dir>/<name>.db` running `statements` in order.
pub async fn create_database(dir: &Path, name: &str, statements: &[&str]) {
    let mut conn = SqliteConnectOptions::new()
        .filename(dir.join(format!("{name}.db")))
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();
    for sql in statements {
        sqlx::raw_sql(sql).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();
}

/// A tenant database with three invoices.
pub async fn seed_tenant(dir: &Path, name: &str) {
    create_database(
        dir,
        name,
        &[
            "CREATE TABLE ven_facturas (
                id INTEGER PRIMARY KEY,
                numero TEXT NOT NULL,
                cliente TEXT,
                total DECIMAL(18,2) NOT NULL,
                anulada BOOLEAN NOT NULL DEFAULT 0
            )",
            "INSERT INTO ven_facturas (numero, cliente, total) VALUES
                ('F-001', 'Flores del Sur', '1250.50'),
                ('F-002', 'Rosas Export', '980.00'),
                ('F-003', 'Flores del Sur', '310.25')",
        ],
    )
    .await;
}

/// Master database with `config_empresas`.
pub async fn seed_master(dir: &Path) {
    create_database(
        dir,
        MASTER_DB,
        &[
            "CREATE TABLE config_empresas (
                codigo_empresa TEXT PRIMARY KEY,
                nombre_comercial TEXT,
                db_name TEXT,
                activo BIT NOT NULL
            )",
            "INSERT INTO config_empresas VALUES
                ('Orquidea', 'Orquidea Flowers S.A.', 'orquidea', 1),
                ('ROSAS', 'Rosas del Valle', 'rosas', 1),
                ('OLD', 'Orquidea Vieja', 'legacy', 0)",
        ],
    )
    .await;
}

/// Temp directory with the master database and the `orquidea` and `rosas` tenants.
pub async fn seeded_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    seed_master(dir.path()).await;
    seed_tenant(dir.path(), "orquidea").await;
    seed_tenant(dir.path(), "rosas").await;
    dir
}

/// Wraps the SQLite factory and counts pool constructions.
#[derive(Debug)]
pub struct CountingFactory {
    inner: SqlitePoolFactory,
    created: AtomicUsize,
    delay: Duration,
    /// Only this database is delayed; `None` delays all of them
    delayed_database: Option<String>,
}

impl CountingFactory {
    pub fn new(dir: &Path) -> Self {
        Self::with_delay(dir, Duration::ZERO)
    }

    /// Creation sleeps for `delay` first, widening the window for races.
    pub fn with_delay(dir: &Path, delay: Duration) -> Self {
        Self {
            inner: SqlitePoolFactory::new(dir, PoolOptions::default()),
            created: AtomicUsize::new(0),
            delay,
            delayed_database: None,
        }
    }

    /// Only creating `database` sleeps for `delay`.
    pub fn with_delay_for(dir: &Path, database: &str, delay: Duration) -> Self {
        Self {
            delayed_database: Some(database.to_string()),
            ..Self::with_delay(dir, delay)
        }
    }

    /// Pools are built with `pool_options` instead of the defaults.
    pub fn with_options(dir: &Path, pool_options: PoolOptions) -> Self {
        Self {
            inner: SqlitePoolFactory::new(dir, pool_options),
            ..Self::new(dir)
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolFactory for CountingFactory {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn create(&self, database: &str) -> DbResult<DbPool> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let delayed = self
            .delayed_database
            .as_deref()
            .is_none_or(|name| name.eq_ignore_ascii_case(database));
        if delayed && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.create(database).await
    }
}

pub fn cache_config() -> PoolCacheConfig {
    PoolCacheConfig {
        idle_timeout: Duration::from_secs(600),
        cleanup_interval: Duration::from_secs(60),
    }
}

pub fn counting_cache(factory: &Arc<CountingFactory>) -> Arc<PoolCache> {
    PoolCache::new(factory.clone(), cache_config())
}

/// Manager over `dir` using a counting factory.
pub fn manager(dir: &Path) -> (DatabaseManager, Arc<CountingFactory>) {
    let factory = Arc::new(CountingFactory::new(dir));
    let settings = ConnectionSettings::sqlite(dir, MASTER_DB);
    let manager = DatabaseManager::init_with(settings, factory.clone(), None).unwrap();
    (manager, factory)
}
