//! Process-wide entry point for the database layer.
//!
//! [`DatabaseManager`] wires the pool cache, query executor and tenant registry
//! together from one set of [`ConnectionSettings`] and owns their shutdown.

use crate::config::ConnectionSettings;
use crate::db::{
    PoolCache, PoolCacheConfig, PoolFactory, PoolHandle, PoolSummary, QueryExecutor,
    TenantTransaction, factory_for,
};
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteOptions, NamedParams, QueryRequest, RowSet, TenantRecord};
use crate::tenant::{SqlTenantSource, TenantRegistry, TenantSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

#[derive(Debug)]
pub struct DatabaseManager {
    settings: ConnectionSettings,
    cache: Arc<PoolCache>,
    executor: QueryExecutor,
    tenants: TenantRegistry,
    shutdown: OnceCell<()>,
}

impl DatabaseManager {
    /// Build the layer for the configured driver.
    ///
    /// No connection is opened here. Must be called inside a tokio runtime,
    /// since the pool cache starts its idle cleanup task.
    pub fn init(settings: ConnectionSettings) -> DbResult<Self> {
        let factory = factory_for(&settings)?;
        Self::init_with(settings, factory, None)
    }

    /// Build the layer with an explicit pool factory and tenant source.
    ///
    /// Without a source, tenants are read from the default database.
    pub fn init_with(
        settings: ConnectionSettings,
        factory: Arc<dyn PoolFactory>,
        tenant_source: Option<Arc<dyn TenantSource>>,
    ) -> DbResult<Self> {
        settings.validate()?;

        let cache = PoolCache::new(factory, PoolCacheConfig::from(&settings.pool_options));
        let executor = QueryExecutor::new(
            Arc::clone(&cache),
            settings.database.clone(),
            settings.query_timeout,
        );
        let source = tenant_source.unwrap_or_else(|| {
            Arc::new(SqlTenantSource::new(
                executor.clone(),
                settings.database.clone(),
            ))
        });

        info!(
            driver = %settings.driver,
            default_database = %settings.database,
            "Database layer initialized"
        );

        Ok(Self {
            settings,
            cache,
            executor,
            tenants: TenantRegistry::new(source),
            shutdown: OnceCell::new(),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn tenants(&self) -> &TenantRegistry {
        &self.tenants
    }

    pub fn default_database(&self) -> &str {
        &self.settings.database
    }

    /// Map a tenant key to its physical database.
    pub async fn resolve_tenant_database(&self, tenant_key: &str) -> DbResult<String> {
        self.tenants.resolve(tenant_key).await
    }

    /// Active tenants, for callers that iterate every tenant.
    pub async fn active_tenants(&self) -> DbResult<Vec<TenantRecord>> {
        self.tenants.active().await
    }

    /// Reload the tenant registry and return the number of records.
    pub async fn refresh_tenants(&self) -> DbResult<usize> {
        self.tenants.refresh().await
    }

    pub async fn acquire_pool(&self, database: &str) -> DbResult<PoolHandle> {
        self.cache.acquire(database).await
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &NamedParams,
        database: &str,
    ) -> DbResult<RowSet> {
        self.executor.execute(sql, params, database).await
    }

    pub async fn execute_static(&self, sql: &str, database: &str) -> DbResult<RowSet> {
        self.executor.execute_static(sql, database).await
    }

    pub async fn execute_with(
        &self,
        request: &QueryRequest,
        options: &ExecuteOptions,
    ) -> DbResult<RowSet> {
        self.executor.execute_with(request, options).await
    }

    /// Run a write on `database` (default database when `None`).
    pub async fn execute_write(
        &self,
        sql: &str,
        params: &NamedParams,
        database: Option<&str>,
    ) -> DbResult<u64> {
        let request = self.request(sql, params.clone(), database);
        self.executor
            .execute_write_with(&request, &ExecuteOptions::default())
            .await
    }

    /// Run a query on `database` (default database when `None`).
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &NamedParams,
        database: Option<&str>,
    ) -> DbResult<RowSet> {
        let request = self.request(sql, params.clone(), database);
        self.executor
            .execute_with(&request, &ExecuteOptions::default())
            .await
    }

    /// Like [`execute_query`](Self::execute_query) with parameters as a JSON object.
    pub async fn execute_query_with_params(
        &self,
        sql: &str,
        params: serde_json::Value,
        database: Option<&str>,
    ) -> DbResult<RowSet> {
        let params = NamedParams::from_json(params).ok_or_else(|| {
            DbError::invalid_input("parameters must be a JSON object of name/value pairs")
        })?;
        self.execute_query(sql, &params, database).await
    }

    /// Resolve `tenant_key` and run the query on that tenant's database.
    pub async fn execute_for_tenant(
        &self,
        tenant_key: &str,
        sql: &str,
        params: &NamedParams,
    ) -> DbResult<RowSet> {
        let database = self.resolve_tenant_database(tenant_key).await?;
        self.executor.execute(sql, params, &database).await
    }

    /// Pool handle for `database`, or the default database when `None`.
    pub async fn get_connection(&self, database: Option<&str>) -> DbResult<PoolHandle> {
        let database = database.unwrap_or(&self.settings.database);
        self.cache.acquire(database).await
    }

    pub async fn get_connection_for_db(&self, database: &str) -> DbResult<PoolHandle> {
        self.cache.acquire(database).await
    }

    pub async fn begin_transaction(&self, database: Option<&str>) -> DbResult<TenantTransaction> {
        self.executor.begin(database).await
    }

    /// Run `SELECT 1` on the default database. Failures are logged, not returned.
    pub async fn test_connection(&self) -> bool {
        match self
            .executor
            .execute_static("SELECT 1", &self.settings.database)
            .await
        {
            Ok(_) => {
                info!(database = %self.settings.database, "Connection test succeeded");
                true
            }
            Err(e) => {
                warn!(
                    database = %self.settings.database,
                    error = %e,
                    "Connection test failed"
                );
                false
            }
        }
    }

    pub async fn pool_stats(&self) -> Vec<PoolSummary> {
        self.cache.stats().await
    }

    pub async fn pool_count(&self) -> usize {
        self.cache.pool_count().await
    }

    /// Close and forget the pool for `database`.
    pub async fn evict(&self, database: &str) -> bool {
        self.cache.evict(database).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.cache.is_closing()
    }

    /// Stop accepting work, wait up to `timeout` for in-flight calls, then
    /// close every pool. Later calls return immediately.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown
            .get_or_init(|| async {
                info!(
                    in_flight = self.cache.in_flight(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Shutting down database layer"
                );
                self.cache.begin_shutdown();
                if !self.cache.wait_idle(timeout).await {
                    warn!(
                        in_flight = self.cache.in_flight(),
                        "Shutdown timeout elapsed with queries in flight, closing anyway"
                    );
                }
                self.cache.close_all().await;
                info!("Database layer shut down");
            })
            .await;
    }

    /// Shut down with the configured timeout.
    pub async fn close_connection(&self) {
        self.shutdown(self.settings.shutdown_timeout).await;
    }

    fn request(&self, sql: &str, params: NamedParams, database: Option<&str>) -> QueryRequest {
        let request = QueryRequest::new(sql).with_params(params);
        match database {
            Some(db) => request.on_database(db),
            None => request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverKind;

    #[tokio::test]
    async fn test_init_rejects_incomplete_mssql_settings() {
        let mut settings = ConnectionSettings::sqlite("/tmp", "erp_master");
        settings.driver = DriverKind::Mssql;
        let err = DatabaseManager::init(settings).unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        assert!(err.to_string().contains("DB_SERVER"));
    }

    #[tokio::test]
    async fn test_init_rejects_missing_default_database() {
        let settings = ConnectionSettings::sqlite("/tmp", "  ");
        assert!(matches!(
            DatabaseManager::init(settings),
            Err(DbError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_params_must_be_object() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            DatabaseManager::init(ConnectionSettings::sqlite(dir.path(), "master")).unwrap();
        let err = manager
            .execute_query_with_params("SELECT 1", serde_json::json!([1, 2]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        manager.close_connection().await;
    }
}
