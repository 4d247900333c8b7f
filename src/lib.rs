//! Tenant database access layer
//!
//! Resolves a tenant key to its physical database, keeps one lazily created
//! connection pool per database and executes parameterized SQL against it.

pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod tables;
pub mod tenant;

pub use config::{Config, ConnectionSettings, DriverKind};
pub use db::{PoolHandle, QueryExecutor, TenantTransaction};
pub use error::{DbError, DbResult};
pub use lifecycle::DatabaseManager;
pub use models::{NamedParams, Row, RowSet, TenantRecord, Value};
pub use tables::Table;
pub use tenant::{StaticTenantSource, TenantRegistry, TenantSource};
