//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Driver pools and the factory seam that builds them
//! - The per-database pool cache
//! - Query execution with named parameters
//! - Row decoding into driver-independent values
//! - Explicit transactions
//! - Backend dispatch helpers

pub mod executor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod pool_cache;
pub mod transaction;
pub mod types;

pub use executor::QueryExecutor;
pub use macros::Backend;
pub use params::{BoundStatement, SqlTemplate};
pub use pool::{DbPool, MssqlPoolFactory, PoolFactory, SqlitePoolFactory, factory_for};
pub use pool_cache::{PoolCache, PoolCacheConfig, PoolHandle, PoolState, PoolSummary};
pub use transaction::TenantTransaction;
