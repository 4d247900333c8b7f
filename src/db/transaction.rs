//! Explicit transactions on one tenant database.
//!
//! A [`TenantTransaction`] owns one dedicated connection until it is committed or
//! rolled back. It also holds the pool handle, so the pool is neither swept as
//! idle nor considered drained at shutdown while the transaction is open.

use crate::db::executor::{mssql, sqlite, with_deadline};
use crate::db::params::BoundStatement;
use crate::db::pool::{DbPool, map_run_error};
use crate::db::pool_cache::PoolHandle;
use crate::error::{DbError, DbResult};
use crate::models::{NamedParams, RowSet};
use sqlx::{Sqlite, Transaction};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type MssqlConnection = bb8::PooledConnection<'static, bb8_tiberius::ConnectionManager>;

const MSSQL_ROLLBACK_IF_OPEN: &str = "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION";

/// Driver-specific transaction.
enum DbTransaction {
    /// SQL Server: a checked-out connection with `BEGIN TRANSACTION` issued.
    Mssql(MssqlConnection),
    /// SQLite transaction
    Sqlite(Transaction<'static, Sqlite>),
}

pub struct TenantTransaction {
    id: String,
    transaction: Option<DbTransaction>,
    started_at: Instant,
    statement_timeout: Duration,
    // Dropped last: releases the in-flight slot after the connection is handed back
    handle: PoolHandle,
}

impl TenantTransaction {
    pub(crate) async fn begin(handle: PoolHandle, statement_timeout: Duration) -> DbResult<Self> {
        let database = handle.database().to_string();
        let transaction = match handle.pool() {
            DbPool::Mssql(pool) => {
                let mut conn = pool
                    .get_owned()
                    .await
                    .map_err(|e| map_run_error(&database, e))?;
                mssql::simple(&mut conn, &database, "BEGIN TRANSACTION").await?;
                DbTransaction::Mssql(conn)
            }
            DbPool::Sqlite(pool) => {
                let tx = pool
                    .begin()
                    .await
                    .map_err(|e| DbError::from_sqlx(e, &database, "BEGIN"))?;
                DbTransaction::Sqlite(tx)
            }
        };

        let id = generate_transaction_id();
        info!(transaction_id = %id, database = %database, "Transaction started");

        Ok(Self {
            id,
            transaction: Some(transaction),
            started_at: Instant::now(),
            statement_timeout,
            handle,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn database(&self) -> &str {
        self.handle.database()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn prepare(&self, sql: &str, params: &NamedParams) -> DbResult<BoundStatement> {
        BoundStatement::prepare(sql, params, self.handle.backend())
    }

    fn active(&mut self) -> DbResult<&mut DbTransaction> {
        self.transaction
            .as_mut()
            .ok_or_else(|| DbError::internal("transaction is no longer active"))
    }

    /// Run a query inside the transaction.
    pub async fn query(&mut self, sql: &str, params: &NamedParams) -> DbResult<RowSet> {
        let stmt = self.prepare(sql, params)?;
        let database = self.handle.database().to_string();
        let timeout = self.statement_timeout;

        let work = async {
            match self.active()? {
                DbTransaction::Mssql(conn) => mssql::fetch(conn, &database, &stmt).await,
                DbTransaction::Sqlite(tx) => sqlite::fetch(&mut **tx, &database, &stmt).await,
            }
        };
        let result = with_deadline(work, timeout, None, "transaction query").await;
        let rows = self.check_interrupted(result)?;

        debug!(transaction_id = %self.id, row_count = rows.len(), "Queried in transaction");
        Ok(rows)
    }

    /// Run a write inside the transaction and return the affected row count.
    pub async fn execute(&mut self, sql: &str, params: &NamedParams) -> DbResult<u64> {
        let stmt = self.prepare(sql, params)?;
        let database = self.handle.database().to_string();
        let timeout = self.statement_timeout;

        let work = async {
            match self.active()? {
                DbTransaction::Mssql(conn) => mssql::execute(conn, &database, &stmt).await,
                DbTransaction::Sqlite(tx) => sqlite::execute(&mut **tx, &database, &stmt).await,
            }
        };
        let result = with_deadline(work, timeout, None, "transaction write").await;
        let rows_affected = self.check_interrupted(result)?;

        debug!(transaction_id = %self.id, rows_affected, "Executed in transaction");
        Ok(rows_affected)
    }

    /// A statement cut off by its deadline leaves the connection state unknown:
    /// roll back and give the connection up. Later calls fail.
    fn check_interrupted<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e @ (DbError::Timeout { .. } | DbError::Cancelled { .. })) = &result {
            warn!(transaction_id = %self.id, error = %e, "Statement interrupted, abandoning transaction");
            self.abandon();
        }
        result
    }

    /// Take the transaction and roll it back in the background.
    fn abandon(&mut self) {
        let Some(transaction) = self.transaction.take() else {
            return;
        };
        match transaction {
            // sqlx queues the rollback on the connection itself
            DbTransaction::Sqlite(tx) => drop(tx),
            DbTransaction::Mssql(mut conn) => {
                let database = self.handle.database().to_string();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) =
                                mssql::simple(&mut conn, &database, MSSQL_ROLLBACK_IF_OPEN).await
                            {
                                warn!(database = %database, error = %e, "Background rollback failed");
                            }
                        });
                    }
                    Err(_) => warn!(
                        database = %database,
                        "No runtime to roll back abandoned transaction"
                    ),
                }
            }
        }
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> DbResult<()> {
        let database = self.handle.database().to_string();
        match self.transaction.take() {
            Some(DbTransaction::Mssql(mut conn)) => {
                mssql::simple(&mut conn, &database, "COMMIT TRANSACTION").await?
            }
            Some(DbTransaction::Sqlite(tx)) => tx
                .commit()
                .await
                .map_err(|e| DbError::from_sqlx(e, &database, "COMMIT"))?,
            None => return Err(DbError::internal("transaction is no longer active")),
        }
        info!(transaction_id = %self.id, database = %database, "Transaction committed");
        Ok(())
    }

    /// Roll back the transaction.
    pub async fn rollback(mut self) -> DbResult<()> {
        let database = self.handle.database().to_string();
        match self.transaction.take() {
            Some(DbTransaction::Mssql(mut conn)) => {
                mssql::simple(&mut conn, &database, MSSQL_ROLLBACK_IF_OPEN).await?
            }
            Some(DbTransaction::Sqlite(tx)) => tx
                .rollback()
                .await
                .map_err(|e| DbError::from_sqlx(e, &database, "ROLLBACK"))?,
            None => return Err(DbError::internal("transaction is no longer active")),
        }
        info!(transaction_id = %self.id, database = %database, "Transaction rolled back");
        Ok(())
    }
}

impl Drop for TenantTransaction {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            warn!(
                transaction_id = %self.id,
                database = %self.handle.database(),
                "Transaction dropped without commit, rolling back"
            );
            self.abandon();
        }
    }
}

impl std::fmt::Debug for TenantTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantTransaction")
            .field("id", &self.id)
            .field("database", &self.handle.database())
            .field("active", &self.transaction.is_some())
            .finish()
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32); // "tx_" + 32 hex chars
        assert_ne!(id, generate_transaction_id());
    }
}
