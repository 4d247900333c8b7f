//! Configuration handling for the tenant database layer.
//!
//! Connection parameters are process-wide: host, credentials, encryption and pool
//! sizing come from CLI arguments or `DB_*` environment variables. Only the target
//! database name varies per call, so it is never part of this configuration beyond
//! the default/master database.

use crate::error::{DbError, DbResult};
use clap::{ArgAction, Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MSSQL_PORT: u16 = 1433;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 0;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

// Per-database pool cache defaults
pub const DEFAULT_DATABASE_POOL_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DATABASE_POOL_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections per database pool (default: 10)
    pub max_connections: Option<u32>,
    /// Minimum idle connections kept per database pool (default: 0)
    pub min_connections: Option<u32>,
    /// Idle timeout for a single pooled connection in seconds (default: 300)
    pub idle_timeout_secs: Option<u64>,
    /// Timeout for establishing a pool and acquiring a connection in seconds (default: 15)
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to test connections before handing them out (default: true)
    pub test_before_acquire: Option<bool>,
    /// Idle time after which a whole database pool is closed (default: 600)
    pub database_pool_idle_timeout_secs: Option<u64>,
    /// How often idle database pools are swept (default: 60)
    pub database_pool_cleanup_interval_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get min_connections with default value.
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    /// Get test_before_acquire with default value.
    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Get database_pool_idle_timeout with default value.
    pub fn database_pool_idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.database_pool_idle_timeout_secs
                .unwrap_or(DEFAULT_DATABASE_POOL_IDLE_TIMEOUT_SECS),
        )
    }

    /// Get database_pool_cleanup_interval with default value.
    pub fn database_pool_cleanup_interval_or_default(&self) -> Duration {
        Duration::from_secs(
            self.database_pool_cleanup_interval_secs
                .unwrap_or(DEFAULT_DATABASE_POOL_CLEANUP_INTERVAL_SECS),
        )
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        let min = self.min_connections_or_default();
        let max = self.max_connections_or_default();
        if min > max {
            return Err(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                min, max
            ));
        }
        if self.database_pool_cleanup_interval_secs == Some(0) {
            return Err("database_pool_cleanup_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Which driver backs the pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Microsoft SQL Server over TDS
    #[default]
    Mssql,
    /// One SQLite file per database in a directory (local development and tests)
    Sqlite,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mssql => write!(f, "mssql"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Database settings parsed from the command line and environment.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Driver used to open database pools
    #[arg(long, value_enum, default_value = "mssql", env = "DB_DRIVER")]
    pub driver: DriverKind,

    /// SQL Server host (optionally host\instance)
    #[arg(long, env = "DB_SERVER")]
    pub server: Option<String>,

    /// SQL Server port
    #[arg(long, default_value_t = DEFAULT_MSSQL_PORT, env = "DB_PORT")]
    pub port: u16,

    /// SQL login user
    #[arg(long, env = "DB_USER")]
    pub user: Option<String>,

    /// SQL login password
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Default/master database (holds config_empresas)
    #[arg(long, env = "DB_DATABASE")]
    pub database: Option<String>,

    /// Require an encrypted connection
    #[arg(long, env = "DB_ENCRYPT", default_value_t = false, action = ArgAction::Set)]
    pub encrypt: bool,

    /// Trust the server certificate without validation
    #[arg(long, env = "DB_TRUST_CERT", default_value_t = true, action = ArgAction::Set)]
    pub trust_cert: bool,

    /// Directory holding `<database>.db` files (sqlite driver only)
    #[arg(long, env = "DB_SQLITE_DIR")]
    pub sqlite_dir: Option<PathBuf>,

    /// Maximum connections per database pool
    #[arg(long, env = "DB_POOL_MAX")]
    pub pool_max: Option<u32>,

    /// Minimum idle connections per database pool
    #[arg(long, env = "DB_POOL_MIN")]
    pub pool_min: Option<u32>,

    /// Connection timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, env = "DB_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Query timeout in seconds
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS, env = "DB_QUERY_TIMEOUT")]
    pub query_timeout: u64,

    /// Seconds a database pool may stay unused before it is closed
    #[arg(long, env = "DB_POOL_IDLE_TIMEOUT")]
    pub pool_idle_timeout: Option<u64>,

    /// Seconds between idle pool sweeps
    #[arg(long, env = "DB_POOL_CLEANUP_INTERVAL")]
    pub pool_cleanup_interval: Option<u64>,

    /// Seconds to wait for in-flight queries at shutdown
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS, env = "DB_SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "LOG_JSON")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            driver: DriverKind::Mssql,
            server: None,
            port: DEFAULT_MSSQL_PORT,
            user: None,
            password: None,
            database: None,
            encrypt: false,
            trust_cert: true,
            sqlite_dir: None,
            pool_max: None,
            pool_min: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            pool_idle_timeout: None,
            pool_cleanup_interval: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Build validated connection settings.
    ///
    /// Fails with `DbError::Configuration` when required settings are missing.
    pub fn connection_settings(&self) -> DbResult<ConnectionSettings> {
        let settings = ConnectionSettings {
            driver: self.driver,
            server: non_empty(&self.server),
            port: self.port,
            user: non_empty(&self.user),
            password: self.password.clone(),
            database: non_empty(&self.database).unwrap_or_default(),
            encrypt: self.encrypt,
            trust_cert: self.trust_cert,
            sqlite_dir: self.sqlite_dir.clone(),
            pool_options: PoolOptions {
                max_connections: self.pool_max,
                min_connections: self.pool_min,
                idle_timeout_secs: None,
                acquire_timeout_secs: Some(self.connect_timeout),
                test_before_acquire: None,
                database_pool_idle_timeout_secs: self.pool_idle_timeout,
                database_pool_cleanup_interval_secs: self.pool_cleanup_interval,
            },
            query_timeout: Duration::from_secs(self.query_timeout),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Validated, process-wide connection parameters.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub driver: DriverKind,
    pub server: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    /// Sensitive - never logged
    pub password: Option<String>,
    /// Default/master database used when a call names no database.
    pub database: String,
    pub encrypt: bool,
    pub trust_cert: bool,
    pub sqlite_dir: Option<PathBuf>,
    pub pool_options: PoolOptions,
    pub query_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl ConnectionSettings {
    /// Settings for the sqlite driver rooted at `dir`.
    pub fn sqlite(dir: impl Into<PathBuf>, default_database: impl Into<String>) -> Self {
        Self {
            driver: DriverKind::Sqlite,
            server: None,
            port: DEFAULT_MSSQL_PORT,
            user: None,
            password: None,
            database: default_database.into(),
            encrypt: false,
            trust_cert: true,
            sqlite_dir: Some(dir.into()),
            pool_options: PoolOptions::default(),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }

    /// Check that every setting the selected driver needs is present.
    pub fn validate(&self) -> DbResult<()> {
        let mut missing = Vec::new();
        match self.driver {
            DriverKind::Mssql => {
                if self.server.is_none() {
                    missing.push("DB_SERVER");
                }
                if self.user.is_none() {
                    missing.push("DB_USER");
                }
                if self.password.as_deref().is_none_or(str::is_empty) {
                    missing.push("DB_PASSWORD");
                }
            }
            DriverKind::Sqlite => {
                if self.sqlite_dir.is_none() {
                    missing.push("DB_SQLITE_DIR");
                }
            }
        }
        if self.database.trim().is_empty() {
            missing.push("DB_DATABASE");
        }
        if !missing.is_empty() {
            return Err(DbError::configuration(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }
        if self.query_timeout.is_zero() {
            return Err(DbError::configuration(
                "query timeout must be greater than 0",
            ));
        }
        self.pool_options
            .validate()
            .map_err(DbError::configuration)
    }
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("driver", &self.driver)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("database", &self.database)
            .field("encrypt", &self.encrypt)
            .field("sqlite_dir", &self.sqlite_dir)
            .field("pool_options", &self.pool_options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mssql_config() -> Config {
        Config {
            server: Some("sql.internal".to_string()),
            user: Some("erp".to_string()),
            password: Some("secret".to_string()),
            database: Some("erp_master".to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.driver, DriverKind::Mssql);
        assert_eq!(config.port, 1433);
        assert!(!config.encrypt);
    }

    #[test]
    fn test_complete_config_produces_settings() {
        let settings = mssql_config().connection_settings().unwrap();
        assert_eq!(settings.server.as_deref(), Some("sql.internal"));
        assert_eq!(settings.database, "erp_master");
        assert_eq!(settings.query_timeout, Duration::from_secs(30));
        assert_eq!(
            settings.pool_options.acquire_timeout_or_default(),
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_missing_credentials_is_configuration_error() {
        let config = Config {
            password: None,
            user: Some("  ".to_string()),
            ..mssql_config()
        };
        let err = config.connection_settings().unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        let msg = err.to_string();
        assert!(msg.contains("DB_USER"));
        assert!(msg.contains("DB_PASSWORD"));
        assert!(!msg.contains("DB_SERVER"));
    }

    #[test]
    fn test_missing_default_database_rejected() {
        let config = Config {
            database: None,
            ..mssql_config()
        };
        let err = config.connection_settings().unwrap_err();
        assert!(err.to_string().contains("DB_DATABASE"));
    }

    #[test]
    fn test_sqlite_driver_needs_only_directory() {
        let config = Config {
            driver: DriverKind::Sqlite,
            sqlite_dir: Some(PathBuf::from("/tmp/tenants")),
            database: Some("master".to_string()),
            ..Config::default()
        };
        assert!(config.connection_settings().is_ok());

        let config = Config {
            sqlite_dir: None,
            ..config
        };
        assert!(config.connection_settings().is_err());
    }

    #[test]
    fn test_debug_masks_password() {
        let settings = mssql_config().connection_settings().unwrap();
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("****"));
    }

    #[test]
    fn test_pool_options_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.max_connections_or_default(), 10);
        assert_eq!(opts.min_connections_or_default(), 0);
        assert!(opts.test_before_acquire_or_default());
        assert_eq!(
            opts.database_pool_idle_timeout_or_default(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_pool_options_validation() {
        let zero_max = PoolOptions {
            max_connections: Some(0),
            ..PoolOptions::default()
        };
        assert!(zero_max.validate().unwrap_err().contains("max_connections"));

        let min_over_max = PoolOptions {
            max_connections: Some(2),
            min_connections: Some(5),
            ..PoolOptions::default()
        };
        assert!(min_over_max.validate().unwrap_err().contains("cannot exceed"));

        let zero_interval = PoolOptions {
            database_pool_cleanup_interval_secs: Some(0),
            ..PoolOptions::default()
        };
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn test_invalid_pool_options_surface_as_configuration_error() {
        let config = Config {
            pool_max: Some(0),
            ..mssql_config()
        };
        assert!(matches!(
            config.connection_settings(),
            Err(DbError::Configuration { .. })
        ));
    }
}
