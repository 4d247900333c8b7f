//! Driver row decoding.
//!
//! Both drivers decode into the same [`Value`] so callers never see a driver type.
//!
//! # Architecture
//!
//! Decoding uses a two-phase approach:
//! 1. `TypeCategory` classifies a column from its declared type and, for SQLite,
//!    the runtime storage class of the value
//! 2. Driver-specific decoders extract the value for that category
//!
//! SQL Server rows carry exact types on the wire (`ColumnData`), so only SQLite
//! needs the classification step.

use crate::models::Value;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tiberius::ColumnData;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for a column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Null,
    Integer,
    Boolean,
    Float,
    Decimal,
    DateTime,
    Date,
    Time,
    Text,
    Binary,
}

/// Classify a SQLite value.
///
/// `storage` is the runtime storage class (`INTEGER`, `REAL`, `TEXT`, `BLOB`, `NULL`),
/// `declared` the column's declared type, which is empty or `NULL` for expressions.
pub fn categorize_sqlite(declared: &str, storage: &str) -> TypeCategory {
    let declared = declared.to_ascii_lowercase();

    match storage.to_ascii_uppercase().as_str() {
        "NULL" => TypeCategory::Null,
        "INTEGER" if declared == "bool" || declared == "boolean" || declared == "bit" => {
            TypeCategory::Boolean
        }
        "INTEGER" => TypeCategory::Integer,
        "REAL" => TypeCategory::Float,
        "BLOB" => TypeCategory::Binary,
        _ => {
            // Text storage: the declared type says what the text means
            if declared.contains("datetime") || declared.contains("timestamp") {
                TypeCategory::DateTime
            } else if declared == "date" {
                TypeCategory::Date
            } else if declared == "time" {
                TypeCategory::Time
            } else if declared.contains("decimal")
                || declared.contains("numeric")
                || declared.contains("money")
            {
                TypeCategory::Decimal
            } else {
                TypeCategory::Text
            }
        }
    }
}

// =============================================================================
// Row to Value Trait
// =============================================================================

/// Trait for converting driver rows into ordered values.
pub trait RowToValues {
    type Error;

    fn column_names(&self) -> Vec<String>;
    fn to_values(&self) -> Result<Vec<Value>, Self::Error>;
}

impl RowToValues for SqliteRow {
    type Error = sqlx::Error;

    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn to_values(&self) -> Result<Vec<Value>, sqlx::Error> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let raw = self.try_get_raw(idx)?;
                let category = if raw.is_null() {
                    TypeCategory::Null
                } else {
                    let storage = raw.type_info();
                    categorize_sqlite(col.type_info().name(), storage.name())
                };
                sqlite::decode_column(self, idx, category)
            })
            .collect()
    }
}

impl RowToValues for tiberius::Row {
    type Error = std::convert::Infallible;

    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn to_values(&self) -> Result<Vec<Value>, Self::Error> {
        Ok(self
            .cells()
            .enumerate()
            .map(|(idx, (_col, data))| mssql::decode_column(self, idx, data))
            .collect())
    }
}

// =============================================================================
// Driver-Specific Decoders
// =============================================================================

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        category: TypeCategory,
    ) -> Result<Value, sqlx::Error> {
        let value = match category {
            TypeCategory::Null => Value::Null,
            TypeCategory::Integer => Value::Int(row.try_get::<i64, _>(idx)?),
            TypeCategory::Boolean => Value::Bool(row.try_get::<i64, _>(idx)? != 0),
            TypeCategory::Float => Value::Float(row.try_get::<f64, _>(idx)?),
            TypeCategory::Binary => Value::Bytes(row.try_get::<Vec<u8>, _>(idx)?),
            TypeCategory::Decimal => Value::Decimal(row.try_get::<String, _>(idx)?),
            TypeCategory::DateTime => parse_text(row.try_get::<String, _>(idx)?, parse_datetime),
            TypeCategory::Date => parse_text(row.try_get::<String, _>(idx)?, |s| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(Value::Date)
            }),
            TypeCategory::Time => parse_text(row.try_get::<String, _>(idx)?, |s| {
                NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                    .ok()
                    .map(Value::Time)
            }),
            TypeCategory::Text => Value::String(row.try_get::<String, _>(idx)?),
        };
        Ok(value)
    }

    /// Text that does not parse is returned unchanged.
    fn parse_text(text: String, parse: impl Fn(&str) -> Option<Value>) -> Value {
        parse(text.trim()).unwrap_or(Value::String(text))
    }

    fn parse_datetime(s: &str) -> Option<Value> {
        ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(Value::DateTime)
    }
}

mod mssql {
    use super::*;

    pub fn decode_column(row: &tiberius::Row, idx: usize, data: &ColumnData<'static>) -> Value {
        match data {
            ColumnData::Bit(Some(b)) => Value::Bool(*b),
            ColumnData::U8(Some(v)) => Value::Int(i64::from(*v)),
            ColumnData::I16(Some(v)) => Value::Int(i64::from(*v)),
            ColumnData::I32(Some(v)) => Value::Int(i64::from(*v)),
            ColumnData::I64(Some(v)) => Value::Int(*v),
            ColumnData::F32(Some(v)) => Value::Float(f64::from(*v)),
            ColumnData::F64(Some(v)) => Value::Float(*v),
            // DECIMAL/NUMERIC keep their exact scale
            ColumnData::Numeric(Some(n)) => Value::Decimal(n.to_string()),
            ColumnData::String(Some(s)) => Value::String(s.to_string()),
            ColumnData::Guid(Some(g)) => Value::String(g.to_string()),
            ColumnData::Binary(Some(b)) => Value::Bytes(b.to_vec()),
            ColumnData::Xml(Some(xml)) => Value::String(xml.to_string()),
            ColumnData::DateTime(Some(_))
            | ColumnData::SmallDateTime(Some(_))
            | ColumnData::DateTime2(Some(_)) => row
                .try_get::<NaiveDateTime, _>(idx)
                .ok()
                .flatten()
                .map_or(Value::Null, Value::DateTime),
            ColumnData::DateTimeOffset(Some(_)) => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
                .ok()
                .flatten()
                .map_or(Value::Null, |dt| Value::DateTime(dt.naive_utc())),
            ColumnData::Date(Some(_)) => row
                .try_get::<NaiveDate, _>(idx)
                .ok()
                .flatten()
                .map_or(Value::Null, Value::Date),
            ColumnData::Time(Some(_)) => row
                .try_get::<NaiveTime, _>(idx)
                .ok()
                .flatten()
                .map_or(Value::Null, Value::Time),
            // All None variants
            _ => Value::Null,
        }
    }
}
