//! Error types for the tenant database layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every variant carries enough context (database, SQL fragment, underlying cause)
//! for a caller to log it and decide whether to continue a batch or abort.

use thiserror::Error;

/// Maximum number of characters kept when a SQL statement is attached to an error.
const SQL_FRAGMENT_LEN: usize = 60;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Tenant not found: '{tenant_key}'")]
    TenantNotFound { tenant_key: String },

    #[error("Tenant key '{tenant_key}' is ambiguous, matches: {}", candidates.join(", "))]
    AmbiguousTenant {
        tenant_key: String,
        /// Distinct database names that matched
        candidates: Vec<String>,
    },

    #[error("Connection to database '{database}' failed: {cause}")]
    ConnectionFailed {
        database: String,
        cause: String,
        suggestion: String,
    },

    #[error("No pooled connection to database '{database}' became free in time")]
    PoolExhausted { database: String },

    #[error("Missing value for parameter @{name}")]
    MissingParameter { name: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Query failed on database '{database}' [{sql}]: {message}")]
    QueryExecution {
        database: String,
        /// Whitespace-collapsed prefix of the statement
        sql: String,
        message: String,
        /// Driver error number (e.g. SQL Server 208 for invalid object name)
        code: Option<String>,
    },

    #[error("Database layer is shut down")]
    ShutDown,

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a tenant not found error.
    pub fn tenant_not_found(tenant_key: impl Into<String>) -> Self {
        Self::TenantNotFound {
            tenant_key: tenant_key.into(),
        }
    }

    /// Create an ambiguous tenant error.
    pub fn ambiguous_tenant(tenant_key: impl Into<String>, candidates: Vec<String>) -> Self {
        Self::AmbiguousTenant {
            tenant_key: tenant_key.into(),
            candidates,
        }
    }

    /// Create a connection failure with a suggestion derived from the cause.
    pub fn connection_failed(database: impl Into<String>, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        Self::ConnectionFailed {
            database: database.into(),
            suggestion: connection_suggestion(&cause).to_string(),
            cause,
        }
    }

    /// Create a pool checkout timeout. The pool is busy, not broken.
    pub fn pool_exhausted(database: impl Into<String>) -> Self {
        Self::PoolExhausted {
            database: database.into(),
        }
    }

    /// Create a missing parameter error.
    pub fn missing_parameter(name: impl Into<String>) -> Self {
        Self::MissingParameter { name: name.into() }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Create a query execution error.
    pub fn query_execution(
        database: impl Into<String>,
        sql: &str,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        Self::QueryExecution {
            database: database.into(),
            sql: sql_fragment(sql),
            message: message.into(),
            code,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::TenantNotFound { .. } => "tenant_not_found",
            Self::AmbiguousTenant { .. } => "ambiguous_tenant",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::MissingParameter { .. } => "missing_parameter",
            Self::Timeout { .. } => "timeout",
            Self::QueryExecution { .. } => "query_execution_error",
            Self::ShutDown => "shut_down",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionFailed { suggestion, .. } => Some(suggestion),
            Self::TenantNotFound { .. } => {
                Some("Check the company code, or refresh the tenant registry if it was just added")
            }
            Self::AmbiguousTenant { .. } => Some("Use the exact company code or database name"),
            Self::Timeout { .. } => Some("Retry with backoff or increase the timeout"),
            Self::PoolExhausted { .. } => {
                Some("Retry with backoff, or raise DB_MAX_CONNECTIONS if this persists")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::PoolExhausted { .. } | Self::Timeout { .. }
        )
    }

    /// True when the error means the underlying connection is unusable.
    ///
    /// A saturated pool is not broken: `PoolExhausted` never degrades it.
    pub fn is_connection_broken(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. })
    }

    /// Render the error as a JSON body for HTTP-facing callers.
    pub fn to_response(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let Some(suggestion) = self.suggestion() {
            body["suggestion"] = serde_json::Value::String(suggestion.to_string());
        }
        if let Self::QueryExecution {
            code: Some(code), ..
        } = self
        {
            body["code"] = serde_json::Value::String(code.clone());
        }
        body
    }

    /// Map a sqlx error raised while talking to `database`.
    pub fn from_sqlx(err: sqlx::Error, database: &str, sql: &str) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                Self::query_execution(database, sql, db_err.message(), code)
            }
            sqlx::Error::PoolTimedOut => Self::pool_exhausted(database),
            sqlx::Error::PoolClosed => Self::connection_failed(database, "connection pool is closed"),
            sqlx::Error::Io(io_err) => Self::connection_failed(database, format!("I/O error: {io_err}")),
            sqlx::Error::Tls(tls_err) => {
                Self::connection_failed(database, format!("TLS error: {tls_err}"))
            }
            sqlx::Error::Protocol(msg) => {
                Self::connection_failed(database, format!("Protocol error: {msg}"))
            }
            sqlx::Error::WorkerCrashed => {
                Self::connection_failed(database, "database worker crashed")
            }
            sqlx::Error::Configuration(msg) => Self::configuration(msg.to_string()),
            other => Self::query_execution(database, sql, other.to_string(), None),
        }
    }

    /// Map a tiberius error raised while talking to `database`.
    pub fn from_tiberius(err: tiberius::error::Error, database: &str, sql: &str) -> Self {
        use tiberius::error::Error as TdsError;

        match err {
            TdsError::Server(token) => Self::query_execution(
                database,
                sql,
                token.message().to_string(),
                Some(token.code().to_string()),
            ),
            err @ (TdsError::Io { .. }
            | TdsError::Protocol(_)
            | TdsError::Tls(_)
            | TdsError::Routing { .. }) => Self::connection_failed(database, err.to_string()),
            other => Self::query_execution(database, sql, other.to_string(), None),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Collapse whitespace and truncate a statement so it can identify the failing query in logs.
pub fn sql_fragment(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SQL_FRAGMENT_LEN {
        return collapsed;
    }
    let mut fragment: String = collapsed.chars().take(SQL_FRAGMENT_LEN).collect();
    fragment.push_str("...");
    fragment
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(cause: &str) -> &'static str {
    let cause = cause.to_lowercase();

    if cause.contains("connection refused") || cause.contains("unreachable") {
        return "Check that the SQL Server host is running and reachable on the configured port";
    }
    if cause.contains("login failed") || cause.contains("authentication") || cause.contains("password") {
        return "Verify DB_USER and DB_PASSWORD";
    }
    if cause.contains("cannot open database")
        || cause.contains("does not exist")
        || cause.contains("unable to open database")
    {
        return "Check that the database name exists on the server";
    }
    if cause.contains("tls") || cause.contains("ssl") || cause.contains("certificate") {
        return "Check DB_ENCRYPT and certificate trust settings";
    }
    if cause.contains("timed out") {
        return "The server did not answer in time; retry later or raise DB_CONNECT_TIMEOUT";
    }
    "Check DB_SERVER, DB_PORT and the database name"
}
