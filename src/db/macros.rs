//! Backend dispatch helpers.
//!
//! This module provides declarative macros that keep per-driver code paths
//! side by side while maintaining linear readability.

/// Driver backend behind a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Mssql,
    Sqlite,
}

impl Backend {
    /// Positional placeholder for the 1-based parameter `position`.
    pub fn placeholder(self, position: usize) -> String {
        match self {
            Backend::Mssql => format!("@P{position}"),
            Backend::Sqlite => format!("?{position}"),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Mssql => write!(f, "mssql"),
            Backend::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Macro for generating pool dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     Mssql(p) => mssql::fetch(p, stmt).await,
///     Sqlite(p) => sqlite::fetch(p, stmt).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Build a [`NamedParams`](crate::models::NamedParams) map.
///
/// ```ignore
/// let params = params! { "codigo" => "ORQ", "activo" => true };
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::models::NamedParams::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut params = $crate::models::NamedParams::new();
        $(
            params.insert($name, $value);
        )+
        params
    }};
}

pub use impl_db_dispatch;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;

    #[test]
    fn test_backend_placeholders() {
        assert_eq!(Backend::Mssql.placeholder(1), "@P1");
        assert_eq!(Backend::Sqlite.placeholder(12), "?12");
        assert_eq!(Backend::Mssql.to_string(), "mssql");
    }

    #[test]
    fn test_params_macro() {
        let params = crate::params! { "@Codigo" => "ORQ", "activo" => true };
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("codigo"), Some(&Value::from("ORQ")));

        let empty = crate::params! {};
        assert!(empty.is_empty());
    }
}
