//! Data models for the tenant database layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;
pub mod tenant;
pub mod value;

// Re-export commonly used types
pub use query::{ExecuteOptions, QueryRequest, Row, RowSet};
pub use tenant::TenantRecord;
pub use value::{NamedParams, Value};
