//! Query-related data models.
//!
//! This module defines types for SQL query requests and results.

use super::value::{NamedParams, Value};
use serde::Serialize;
use serde::ser::SerializeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A query against one tenant database.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub sql: String,
    pub params: NamedParams,
    /// Target database. `None` routes to the configured default database.
    pub database: Option<String>,
    /// Overrides the configured query timeout.
    pub timeout: Option<Duration>,
}

impl QueryRequest {
    /// Create a new query request with no parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: NamedParams::new(),
            database: None,
            timeout: None,
        }
    }

    /// Add a named parameter.
    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name, value);
        self
    }

    /// Replace all parameters.
    pub fn with_params(mut self, params: NamedParams) -> Self {
        self.params = params;
        self
    }

    /// Set the target database.
    pub fn on_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-call execution controls.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Bounds pool acquisition plus execution. Falls back to the request, then the default.
    pub timeout: Option<Duration>,
    /// Cancelling the token aborts the call with `DbError::Cancelled`.
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One result row. Columns keep the order and spelling returned by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Look up a column by name, exact spelling first, then ignoring ASCII case.
    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(column))
            })?;
        self.values.get(idx)
    }

    pub fn get_index(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Iterate `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

impl Serialize for Row {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Tabular result of a query, decoupled from any driver's native result type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub execution_time_ms: u64,
}

impl RowSet {
    /// Get the number of rows in the result.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// First column of the first row, for `SELECT COUNT(*)`-style queries.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get_index(0))
    }
}
