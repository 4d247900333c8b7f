//! Tenant registry.
//!
//! Maps a logical tenant key (company code or a commercial name pattern) to the
//! physical database holding that tenant's data. Records come from a
//! [`TenantSource`] and are cached until the next [`TenantRegistry::refresh`].

use crate::db::QueryExecutor;
use crate::error::{DbError, DbResult};
use crate::models::{Row, TenantRecord};
use crate::tables::Table;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Where tenant records are loaded from.
#[async_trait]
pub trait TenantSource: Send + Sync + std::fmt::Debug {
    async fn load(&self) -> DbResult<Vec<TenantRecord>>;
}

/// A fixed list of tenants.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantSource {
    records: Vec<TenantRecord>,
}

impl StaticTenantSource {
    pub fn new(records: Vec<TenantRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl TenantSource for StaticTenantSource {
    async fn load(&self) -> DbResult<Vec<TenantRecord>> {
        Ok(self.records.clone())
    }
}

/// Reads `config_empresas` from the master database.
#[derive(Debug, Clone)]
pub struct SqlTenantSource {
    executor: QueryExecutor,
    master_database: String,
}

impl SqlTenantSource {
    pub fn new(executor: QueryExecutor, master_database: impl Into<String>) -> Self {
        Self {
            executor,
            master_database: master_database.into(),
        }
    }

    fn load_sql() -> String {
        format!(
            "SELECT codigo_empresa AS tenant_key, nombre_comercial AS commercial_name, \
             db_name AS database_name, activo AS active FROM {}",
            Table::ConfigEmpresas
        )
    }
}

#[async_trait]
impl TenantSource for SqlTenantSource {
    async fn load(&self) -> DbResult<Vec<TenantRecord>> {
        let rows = self
            .executor
            .execute_static(&Self::load_sql(), &self.master_database)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows.rows {
            match record_from_row(row) {
                Some(record) if record.is_valid() => records.push(record),
                Some(record) => warn!(
                    tenant_key = %record.tenant_key,
                    "Skipping active tenant without a database name"
                ),
                None => warn!("Skipping tenant row without a company code"),
            }
        }
        Ok(records)
    }
}

fn record_from_row(row: &Row) -> Option<TenantRecord> {
    let text = |column: &str| {
        row.get(column)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let tenant_key = text("tenant_key")?;
    Some(TenantRecord {
        tenant_key,
        commercial_name: text("commercial_name"),
        database_name: text("database_name").unwrap_or_default(),
        active: row
            .get("active")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

/// Cached tenant lookup.
#[derive(Debug)]
pub struct TenantRegistry {
    source: Arc<dyn TenantSource>,
    records: RwLock<Option<Arc<[TenantRecord]>>>,
    // Serializes loads so concurrent first lookups hit the source once
    load_lock: Mutex<()>,
}

impl TenantRegistry {
    pub fn new(source: Arc<dyn TenantSource>) -> Self {
        Self {
            source,
            records: RwLock::new(None),
            load_lock: Mutex::new(()),
        }
    }

    /// Resolve a tenant key to its database name.
    pub async fn resolve(&self, tenant_key: &str) -> DbResult<String> {
        let records = self.records().await?;
        let database = match_tenant(&records, tenant_key)?;
        debug!(tenant_key = %tenant_key, database = %database, "Resolved tenant");
        Ok(database)
    }

    /// All cached records, loading them on first use.
    pub async fn list(&self) -> DbResult<Arc<[TenantRecord]>> {
        self.records().await
    }

    /// Active tenants only, in source order.
    pub async fn active(&self) -> DbResult<Vec<TenantRecord>> {
        let records = self.records().await?;
        Ok(records.iter().filter(|r| r.active).cloned().collect())
    }

    /// Reload records from the source.
    pub async fn refresh(&self) -> DbResult<usize> {
        let _guard = self.load_lock.lock().await;
        let loaded = self.load().await?;
        Ok(loaded.len())
    }

    /// Forget cached records; the next lookup reloads them.
    pub async fn invalidate(&self) {
        *self.records.write().await = None;
    }

    async fn records(&self) -> DbResult<Arc<[TenantRecord]>> {
        if let Some(records) = self.records.read().await.as_ref() {
            return Ok(Arc::clone(records));
        }

        let _guard = self.load_lock.lock().await;
        // Another caller may have loaded while we waited
        if let Some(records) = self.records.read().await.as_ref() {
            return Ok(Arc::clone(records));
        }
        self.load().await
    }

    async fn load(&self) -> DbResult<Arc<[TenantRecord]>> {
        let records: Arc<[TenantRecord]> = self.source.load().await?.into();
        info!(
            tenants = records.len(),
            active = records.iter().filter(|r| r.active).count(),
            "Loaded tenant registry"
        );
        *self.records.write().await = Some(Arc::clone(&records));
        Ok(records)
    }
}

/// Pick the database for `tenant_key` among `records`.
///
/// Exact matches (key ignoring ASCII case, or database name) win over partial
/// matches (case-insensitive substring of key or commercial name). `%` markers
/// around the key are stripped. Inactive records never match.
pub fn match_tenant(records: &[TenantRecord], tenant_key: &str) -> DbResult<String> {
    let needle = tenant_key.trim().trim_matches('%').trim();
    if needle.is_empty() {
        return Err(DbError::tenant_not_found(tenant_key));
    }

    let active = || records.iter().filter(|r| r.active);

    let exact = distinct_databases(
        active().filter(|r| r.tenant_key.eq_ignore_ascii_case(needle) || r.database_name == needle),
    );
    if !exact.is_empty() {
        return single(exact, tenant_key);
    }

    let lowered = needle.to_lowercase();
    let partial = distinct_databases(active().filter(|r| {
        r.tenant_key.to_lowercase().contains(&lowered)
            || r
                .commercial_name
                .as_deref()
                .is_some_and(|name| name.to_lowercase().contains(&lowered))
    }));
    single(partial, tenant_key)
}

fn distinct_databases<'a>(matches: impl Iterator<Item = &'a TenantRecord>) -> BTreeSet<String> {
    matches.map(|r| r.database_name.clone()).collect()
}

fn single(databases: BTreeSet<String>, tenant_key: &str) -> DbResult<String> {
    let mut iter = databases.into_iter();
    match (iter.next(), iter.next()) {
        (None, _) => Err(DbError::tenant_not_found(tenant_key)),
        (Some(db), None) => Ok(db),
        (Some(first), Some(second)) => {
            let mut candidates = vec![first, second];
            candidates.extend(iter);
            Err(DbError::ambiguous_tenant(tenant_key, candidates))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn records() -> Vec<TenantRecord> {
        vec![
            TenantRecord::new("Orquidea", "orquidea").with_commercial_name("Orquidea Flowers S.A."),
            TenantRecord::new("ROSAS", "rosas_db").with_commercial_name("Rosas del Valle"),
            TenantRecord::new("ROSAL", "rosal_db").with_commercial_name("Rosal Export"),
            TenantRecord::new("OLD", "legacy").with_commercial_name("Orquidea Vieja").inactive(),
            TenantRecord::new("FLOR1", "flores").with_commercial_name("Flores Uno"),
            TenantRecord::new("FLOR2", "flores").with_commercial_name("Flores Dos"),
        ]
    }

    #[test]
    fn test_exact_key_ignores_case() {
        assert_eq!(match_tenant(&records(), "orquidea").unwrap(), "orquidea");
        assert_eq!(match_tenant(&records(), "  ROSAS ").unwrap(), "rosas_db");
    }

    #[test]
    fn test_exact_database_name() {
        assert_eq!(match_tenant(&records(), "rosal_db").unwrap(), "rosal_db");
    }

    #[test]
    fn test_percent_pattern_matches_commercial_name() {
        assert_eq!(match_tenant(&records(), "%Orquidea%").unwrap(), "orquidea");
        assert_eq!(match_tenant(&records(), "%flowers%").unwrap(), "orquidea");
    }

    #[test]
    fn test_inactive_records_never_match() {
        let err = match_tenant(&records(), "OLD").unwrap_err();
        assert!(matches!(err, DbError::TenantNotFound { .. }));
        assert!(match_tenant(&records(), "Vieja").is_err());
    }

    #[test]
    fn test_ambiguous_partial_match_lists_candidates() {
        let err = match_tenant(&records(), "%ros%").unwrap_err();
        match err {
            DbError::AmbiguousTenant { candidates, .. } => {
                assert_eq!(candidates, vec!["rosal_db".to_string(), "rosas_db".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_records_sharing_a_database_are_not_ambiguous() {
        assert_eq!(match_tenant(&records(), "flor").unwrap(), "flores");
    }

    #[test]
    fn test_empty_key_is_not_found() {
        for key in ["", "   ", "%%"] {
            assert!(matches!(
                match_tenant(&records(), key),
                Err(DbError::TenantNotFound { .. })
            ));
        }
    }

    #[test]
    fn test_unknown_key() {
        assert!(matches!(
            match_tenant(&records(), "nope"),
            Err(DbError::TenantNotFound { .. })
        ));
    }

    #[derive(Debug, Default)]
    struct CountingSource {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl TenantSource for CountingSource {
        async fn load(&self) -> DbResult<Vec<TenantRecord>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(records())
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_loads_hit_source_once() {
        let source = Arc::new(CountingSource::default());
        let registry = Arc::new(TenantRegistry::new(source.clone()));

        let lookups: Vec<_> = (0..10)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.resolve("Orquidea").await })
            })
            .collect();
        for lookup in lookups {
            assert_eq!(lookup.await.unwrap().unwrap(), "orquidea");
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        registry.refresh().await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);

        registry.invalidate().await;
        assert_eq!(registry.list().await.unwrap().len(), records().len());
        assert_eq!(source.loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_active_filters_inactive() {
        let registry = TenantRegistry::new(Arc::new(StaticTenantSource::new(records())));
        let active = registry.active().await.unwrap();
        assert_eq!(active.len(), 5);
        assert!(active.iter().all(|r| r.active));
    }
}
