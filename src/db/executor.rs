//! Query execution engine.
//!
//! This module provides query execution functionality with support for:
//! - Named `@name` parameters bound through the driver
//! - Per-call timeouts covering pool acquisition and execution
//! - Cooperative cancellation
//! - Explicit transactions on one dedicated connection
//!
//! # Architecture
//!
//! The executor uses backend-specific implementations organized in submodules:
//! - `mssql`: SQL Server via tiberius
//! - `sqlite`: SQLite via sqlx
//!
//! Each submodule provides identical functionality adapted to its driver. The
//! functions take a connection (or pool) rather than a handle so transactions
//! reuse them.

use crate::db::params::{BoundStatement, SqlTemplate};
use crate::db::pool::map_run_error;
use crate::db::pool_cache::{PoolCache, PoolHandle};
use crate::db::transaction::TenantTransaction;
use crate::db::types::RowToValues;
use crate::error::{DbError, DbResult};
use crate::impl_db_dispatch;
use crate::models::{ExecuteOptions, NamedParams, QueryRequest, Row, RowSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs SQL against tenant databases through the pool cache.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    cache: Arc<PoolCache>,
    default_database: String,
    default_timeout: Duration,
}

impl QueryExecutor {
    /// Create a new query executor.
    ///
    /// `default_database` is used when a request names no database.
    pub fn new(
        cache: Arc<PoolCache>,
        default_database: impl Into<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            default_database: default_database.into(),
            default_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<PoolCache> {
        &self.cache
    }

    pub fn default_database(&self) -> &str {
        &self.default_database
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Execute `sql` on `database` with named parameters.
    pub async fn execute(
        &self,
        sql: &str,
        params: &NamedParams,
        database: &str,
    ) -> DbResult<RowSet> {
        let request = QueryRequest::new(sql)
            .with_params(params.clone())
            .on_database(database);
        self.execute_with(&request, &ExecuteOptions::default()).await
    }

    /// Execute a statement without parameters.
    pub async fn execute_static(&self, sql: &str, database: &str) -> DbResult<RowSet> {
        self.execute(sql, &NamedParams::new(), database).await
    }

    /// Execute a request with explicit timeout and cancellation.
    pub async fn execute_with(
        &self,
        request: &QueryRequest,
        options: &ExecuteOptions,
    ) -> DbResult<RowSet> {
        self.run(request, options, |handle, stmt| async move {
            let database = handle.database();
            impl_db_dispatch!(handle.pool(), {
                Mssql(pool) => {
                    let mut conn = pool.get().await.map_err(|e| map_run_error(database, e))?;
                    mssql::fetch(&mut conn, database, &stmt).await
                },
                Sqlite(pool) => {
                    let mut conn = pool
                        .acquire()
                        .await
                        .map_err(|e| DbError::from_sqlx(e, database, &stmt.sql))?;
                    sqlite::fetch(&mut conn, database, &stmt).await
                },
            })
        })
        .await
    }

    /// Execute an INSERT/UPDATE/DELETE and return the affected row count.
    pub async fn execute_write(
        &self,
        sql: &str,
        params: &NamedParams,
        database: &str,
    ) -> DbResult<u64> {
        let request = QueryRequest::new(sql)
            .with_params(params.clone())
            .on_database(database);
        self.execute_write_with(&request, &ExecuteOptions::default())
            .await
    }

    /// Write form of [`execute_with`](Self::execute_with).
    pub async fn execute_write_with(
        &self,
        request: &QueryRequest,
        options: &ExecuteOptions,
    ) -> DbResult<u64> {
        self.run(request, options, |handle, stmt| async move {
            let database = handle.database();
            impl_db_dispatch!(handle.pool(), {
                Mssql(pool) => {
                    let mut conn = pool.get().await.map_err(|e| map_run_error(database, e))?;
                    mssql::execute(&mut conn, database, &stmt).await
                },
                Sqlite(pool) => sqlite::execute(pool, database, &stmt).await,
            })
        })
        .await
    }

    /// Start a transaction on `database` (or the default database).
    pub async fn begin(&self, database: Option<&str>) -> DbResult<TenantTransaction> {
        let database = self.target(database)?;
        let timeout = self.default_timeout;
        let begin = async {
            let handle = self.cache.acquire(&database).await?;
            TenantTransaction::begin(handle, timeout).await
        };
        match tokio::time::timeout(timeout, begin).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout("begin transaction", timeout)),
        }
    }

    fn target(&self, database: Option<&str>) -> DbResult<String> {
        let database = database
            .map(str::trim)
            .unwrap_or(self.default_database.as_str());
        if database.is_empty() {
            return Err(DbError::invalid_input("database name cannot be empty"));
        }
        Ok(database.to_string())
    }

    /// Shared path: bind, acquire, run, with timeout, cancellation and health reporting.
    async fn run<T, F, Fut>(
        &self,
        request: &QueryRequest,
        options: &ExecuteOptions,
        op: F,
    ) -> DbResult<T>
    where
        F: FnOnce(Arc<PoolHandle>, BoundStatement) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let database = self.target(request.database.as_deref())?;
        let timeout = options
            .timeout
            .or(request.timeout)
            .unwrap_or(self.default_timeout);

        // Bind before touching the pool so a missing parameter needs no connection
        let template = SqlTemplate::parse(&request.sql);
        let values = template.bind(&request.params)?;

        debug!(
            database = %database,
            params = values.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Executing query"
        );

        let work = async {
            let handle = Arc::new(self.cache.acquire(&database).await?);
            let stmt = BoundStatement {
                sql: template.render(handle.backend()),
                values,
            };
            let result = op(Arc::clone(&handle), stmt).await;
            if let Err(e) = &result {
                if e.is_connection_broken() {
                    handle.mark_degraded();
                }
            }
            result
        };

        with_deadline(work, timeout, options.cancel.as_ref(), "query execution").await
    }
}

/// Bound `work` by `timeout` and abort it when `cancel` fires.
///
/// Dropping the driver future returns its connection to the pool; bb8 and sqlx
/// test connections on checkout, so an interrupted one is discarded there.
pub(crate) async fn with_deadline<T>(
    work: impl Future<Output = DbResult<T>>,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
    operation: &str,
) -> DbResult<T> {
    let bounded = async {
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(operation, timeout)),
        }
    };

    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(DbError::cancelled(operation)),
                result = bounded => result,
            }
        }
        None => bounded.await,
    }
}

/// Assemble a [`RowSet`] from decoded driver rows.
fn build_rowset<R: RowToValues>(
    columns: Vec<String>,
    rows: &[R],
    start: Instant,
) -> Result<RowSet, R::Error> {
    let shared: Arc<[String]> = columns.clone().into();
    let rows = rows
        .iter()
        .map(|row| Ok(Row::new(Arc::clone(&shared), row.to_values()?)))
        .collect::<Result<Vec<_>, R::Error>>()?;

    Ok(RowSet {
        columns,
        rows,
        rows_affected: None,
        execution_time_ms: start.elapsed().as_millis() as u64,
    })
}

// =============================================================================
// Backend-Specific Implementations
// =============================================================================

pub(crate) mod mssql {
    use super::*;
    use crate::db::params::bind_mssql_value;

    /// Client type handed out by the bb8 pool.
    pub type MssqlClient = <bb8_tiberius::ConnectionManager as bb8::ManageConnection>::Connection;

    fn query_for(stmt: &BoundStatement) -> tiberius::Query<'_> {
        let mut query = tiberius::Query::new(stmt.sql.as_str());
        for value in &stmt.values {
            bind_mssql_value(&mut query, value);
        }
        query
    }

    pub async fn fetch(
        client: &mut MssqlClient,
        database: &str,
        stmt: &BoundStatement,
    ) -> DbResult<RowSet> {
        let start = Instant::now();
        let map_err = |e| DbError::from_tiberius(e, database, &stmt.sql);

        let mut stream = query_for(stmt).query(client).await.map_err(map_err)?;
        let columns: Vec<String> = stream
            .columns()
            .await
            .map_err(map_err)?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = stream.into_first_result().await.map_err(map_err)?;

        let Ok(row_set) = build_rowset(columns, &rows, start);
        Ok(row_set)
    }

    pub async fn execute(
        client: &mut MssqlClient,
        database: &str,
        stmt: &BoundStatement,
    ) -> DbResult<u64> {
        let result = query_for(stmt)
            .execute(client)
            .await
            .map_err(|e| DbError::from_tiberius(e, database, &stmt.sql))?;
        Ok(result.total())
    }

    /// Run a statement that returns nothing (transaction control).
    pub async fn simple(client: &mut MssqlClient, database: &str, sql: &str) -> DbResult<()> {
        client
            .execute(sql, &[])
            .await
            .map_err(|e| DbError::from_tiberius(e, database, sql))?;
        Ok(())
    }
}

pub(crate) mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_value;
    use futures_util::TryStreamExt;
    use sqlx::sqlite::{SqliteConnection, SqliteRow};
    use sqlx::{Column, Executor, Sqlite, Statement};

    pub async fn fetch(
        conn: &mut SqliteConnection,
        database: &str,
        stmt: &BoundStatement,
    ) -> DbResult<RowSet> {
        let start = Instant::now();
        let map_err = |e| DbError::from_sqlx(e, database, &stmt.sql);

        // When there are no values, run raw SQL so multi-statement scripts work
        let rows: Vec<SqliteRow> = if stmt.values.is_empty() {
            (&mut *conn)
                .fetch(stmt.sql.as_str())
                .try_collect()
                .await
                .map_err(map_err)?
        } else {
            let mut query = sqlx::query(&stmt.sql);
            for value in &stmt.values {
                query = bind_sqlite_value(query, value);
            }
            query.fetch(&mut *conn).try_collect().await.map_err(map_err)?
        };

        let columns = match rows.first() {
            Some(row) => row.column_names(),
            // Scripts that already ran (DDL) may not prepare again; they have no columns
            None => statement_columns(conn, &stmt.sql).await.unwrap_or_else(|e| {
                debug!(database = %database, error = %e, "No column metadata for empty result");
                Vec::new()
            }),
        };
        build_rowset(columns, &rows, start).map_err(map_err)
    }

    /// Result columns of `sql` from the prepared statement, for results without rows.
    async fn statement_columns(conn: &mut SqliteConnection, sql: &str) -> sqlx::Result<Vec<String>> {
        let prepared = conn.prepare(sql).await?;
        Ok(prepared
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect())
    }

    pub async fn execute<'c, E>(executor: E, database: &str, stmt: &BoundStatement) -> DbResult<u64>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let result = if stmt.values.is_empty() {
            executor.execute(stmt.sql.as_str()).await
        } else {
            let mut query = sqlx::query(&stmt.sql);
            for value in &stmt.values {
                query = bind_sqlite_value(query, value);
            }
            query.execute(executor).await
        };

        result
            .map(|r| r.rows_affected())
            .map_err(|e| DbError::from_sqlx(e, database, &stmt.sql))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let err = with_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
            None,
            "query execution",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_with_deadline_prefers_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let err = with_deadline(
            async { Ok(1) },
            Duration::from_secs(5),
            Some(&token),
            "query execution",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result_through() {
        let token = CancellationToken::new();
        let value = with_deadline(
            async { Ok(7) },
            Duration::from_secs(5),
            Some(&token),
            "query execution",
        )
        .await
        .unwrap();
        assert_eq!(value, 7);
    }
}
