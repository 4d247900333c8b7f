//! Values exchanged with the drivers: bound parameters and decoded columns.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// A single SQL value.
///
/// Columns are kept as the driver returns them: DECIMAL/NUMERIC stay as their exact
/// textual form, date/time columns stay typed.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    /// Exact decimal representation, e.g. "1250.50"
    Decimal(String),
    String(String),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Binary data (base64 encoded in JSON)
    Bytes(Vec<u8>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::String(_) => "string",
            Self::DateTime(_) => "datetime",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Bytes(_) => "bytes",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Decimal(s) | Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interpret bit/int/text flags the way SQL Server `bit` columns show up.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(v) => Some(*v != 0),
            Self::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "s" | "si" | "y" | "yes" => Some(true),
                "0" | "false" | "n" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        match self {
            Self::Null => serializer.serialize_none(),
            Self::Bool(v) => serializer.serialize_bool(*v),
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::Decimal(v) | Self::String(v) => serializer.serialize_str(v),
            Self::DateTime(v) => serializer.collect_str(&v.format("%Y-%m-%dT%H:%M:%S%.f")),
            Self::Date(v) => serializer.collect_str(&v.format("%Y-%m-%d")),
            Self::Time(v) => serializer.collect_str(&v.format("%H:%M:%S%.f")),
            Self::Bytes(v) => serializer.serialize_str(&STANDARD.encode(v)),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Self::String(s),
            // Nested structures are passed as their JSON text
            other => Self::String(other.to_string()),
        }
    }
}

macro_rules! impl_from_for_value {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )+
    };
}

impl_from_for_value!(
    bool => Bool,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f64 => Float,
    String => String,
    NaiveDateTime => DateTime,
    NaiveDate => Date,
    NaiveTime => Time,
    Vec<u8> => Bytes,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Named parameter map bound to `@name` placeholders.
///
/// Names are matched case-insensitively and a leading `@` is optional, so
/// `@Username`, `username` and `USERNAME` address the same entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedParams {
    values: HashMap<String, Value>,
}

impl NamedParams {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(name: &str) -> String {
        name.trim().trim_start_matches('@').to_lowercase()
    }

    /// Insert a parameter, replacing any previous value with the same name.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<Value>) {
        self.values
            .insert(Self::normalize(name.as_ref()), value.into());
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(&Self::normalize(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&Self::normalize(name))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Build from a JSON object, as received by HTTP handlers.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => Some(map.into_iter().collect()),
            serde_json::Value::Null => Some(Self::new()),
            _ => None,
        }
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for NamedParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}
