//! Driver connection pools.
//!
//! A [`DbPool`] is one driver pool bound to one physical database. Pools are
//! built by a [`PoolFactory`], which holds the process-wide connection settings
//! and only takes the database name per call.

use crate::config::{ConnectionSettings, DriverKind, PoolOptions};
use crate::db::macros::Backend;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiberius::{AuthMethod, EncryptionLevel};
use tracing::debug;

/// SQL Server pool: bb8 over tiberius clients.
pub type MssqlPool = bb8::Pool<bb8_tiberius::ConnectionManager>;

/// Application name reported to SQL Server (visible in `sys.dm_exec_sessions`).
const APPLICATION_NAME: &str = "tenant-db";

/// Database-specific connection pool.
#[derive(Clone)]
pub enum DbPool {
    Mssql(MssqlPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    ///
    /// bb8 has no explicit close: idle connections are dropped once the last
    /// clone of the pool goes away.
    pub async fn close(&self) {
        impl_db_dispatch!(self, {
            Mssql(_pool) => {},
            Sqlite(pool) => pool.close().await,
        })
    }

    /// Get the backend for this pool.
    pub fn backend(&self) -> Backend {
        match self {
            DbPool::Mssql(_) => Backend::Mssql,
            DbPool::Sqlite(_) => Backend::Sqlite,
        }
    }

    /// `(open, idle)` connection counts.
    pub fn connection_counts(&self) -> (u32, u32) {
        impl_db_dispatch!(self, {
            Mssql(pool) => {
                let state = pool.state();
                (state.connections, state.idle_connections)
            },
            Sqlite(pool) => (pool.size(), pool.num_idle() as u32),
        })
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (open, idle) = self.connection_counts();
        f.debug_struct("DbPool")
            .field("backend", &self.backend())
            .field("open", &open)
            .field("idle", &idle)
            .finish()
    }
}

/// Builds pools for a database name.
///
/// The pool cache calls this at most once per database at a time; implementations
/// should open (or at least validate) a connection so a wrong name fails here.
#[async_trait]
pub trait PoolFactory: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> Backend;

    async fn create(&self, database: &str) -> DbResult<DbPool>;
}

/// Pick the factory for the configured driver.
pub fn factory_for(settings: &ConnectionSettings) -> DbResult<Arc<dyn PoolFactory>> {
    match settings.driver {
        DriverKind::Mssql => Ok(Arc::new(MssqlPoolFactory::new(settings.clone()))),
        DriverKind::Sqlite => Ok(Arc::new(SqlitePoolFactory::from_settings(settings)?)),
    }
}

/// Map a bb8 checkout failure.
pub(crate) fn map_run_error<E: std::fmt::Display>(
    database: &str,
    err: bb8::RunError<E>,
) -> DbError {
    match err {
        bb8::RunError::User(e) => DbError::connection_failed(database, e.to_string()),
        bb8::RunError::TimedOut => DbError::pool_exhausted(database),
    }
}

// =============================================================================
// SQL Server
// =============================================================================

/// Production factory: tiberius clients pooled by bb8.
pub struct MssqlPoolFactory {
    settings: ConnectionSettings,
}

impl MssqlPoolFactory {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }

    /// Build the tiberius configuration targeting `database`.
    fn tiberius_config(&self, database: &str) -> DbResult<tiberius::Config> {
        let server = self
            .settings
            .server
            .as_deref()
            .ok_or_else(|| DbError::configuration("DB_SERVER is not set"))?;
        let user = self
            .settings
            .user
            .as_deref()
            .ok_or_else(|| DbError::configuration("DB_USER is not set"))?;
        let password = self.settings.password.as_deref().unwrap_or_default();

        let mut config = tiberius::Config::new();
        config.host(server);
        config.port(self.settings.port);
        config.authentication(AuthMethod::sql_server(user, password));
        config.database(database);
        config.application_name(APPLICATION_NAME);
        config.encryption(if self.settings.encrypt {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });
        if self.settings.trust_cert {
            config.trust_cert();
        }
        Ok(config)
    }
}

impl std::fmt::Debug for MssqlPoolFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlPoolFactory")
            .field("server", &self.settings.server)
            .field("port", &self.settings.port)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PoolFactory for MssqlPoolFactory {
    fn backend(&self) -> Backend {
        Backend::Mssql
    }

    async fn create(&self, database: &str) -> DbResult<DbPool> {
        let config = self.tiberius_config(database)?;
        let opts = &self.settings.pool_options;
        let min_idle = Some(opts.min_connections_or_default()).filter(|min| *min > 0);

        let pool = bb8::Pool::builder()
            .max_size(opts.max_connections_or_default())
            .min_idle(min_idle)
            .idle_timeout(Some(opts.idle_timeout_or_default()))
            .connection_timeout(opts.acquire_timeout_or_default())
            .test_on_check_out(opts.test_before_acquire_or_default())
            .retry_connection(false)
            .build(bb8_tiberius::ConnectionManager::new(config))
            .await
            .map_err(|e| DbError::connection_failed(database, e.to_string()))?;

        // Open one connection now so a wrong database name fails here
        pool.get().await.map_err(|e| match e {
            bb8::RunError::User(e) => DbError::connection_failed(database, e.to_string()),
            bb8::RunError::TimedOut => {
                DbError::connection_failed(database, "timed out opening the first connection")
            }
        })?;

        debug!(database = %database, "SQL Server pool ready");
        Ok(DbPool::Mssql(pool))
    }
}

// =============================================================================
// SQLite
// =============================================================================

/// Local driver: one `<database>.db` file per database inside a directory.
#[derive(Debug, Clone)]
pub struct SqlitePoolFactory {
    dir: PathBuf,
    pool_options: PoolOptions,
}

impl SqlitePoolFactory {
    pub fn new(dir: impl Into<PathBuf>, pool_options: PoolOptions) -> Self {
        Self {
            dir: dir.into(),
            pool_options,
        }
    }

    pub fn from_settings(settings: &ConnectionSettings) -> DbResult<Self> {
        let dir = settings
            .sqlite_dir
            .clone()
            .ok_or_else(|| DbError::configuration("DB_SQLITE_DIR is not set"))?;
        Ok(Self::new(dir, settings.pool_options.clone()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `database`. Names are restricted so they cannot escape the directory.
    pub fn database_path(&self, database: &str) -> DbResult<PathBuf> {
        let valid = !database.is_empty()
            && database
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(DbError::invalid_input(format!(
                "invalid database name '{database}'"
            )));
        }
        Ok(self.dir.join(format!("{}.db", database.to_lowercase())))
    }
}

#[async_trait]
impl PoolFactory for SqlitePoolFactory {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn create(&self, database: &str) -> DbResult<DbPool> {
        let path = self.database_path(database)?;
        let opts = &self.pool_options;

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(false)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(opts.min_connections_or_default())
            .max_connections(opts.max_connections_or_default())
            .acquire_timeout(opts.acquire_timeout_or_default())
            .idle_timeout(Some(opts.idle_timeout_or_default()))
            .test_before_acquire(opts.test_before_acquire_or_default())
            .connect_with(options)
            .await
            .map_err(|e| DbError::connection_failed(database, e.to_string()))?;

        debug!(database = %database, path = %path.display(), "SQLite pool ready");
        Ok(DbPool::Sqlite(pool))
    }
}
