//! Table names used in generated SQL.
//!
//! Values are always bound as parameters; identifiers cannot be, so every table
//! name that ends up in a statement comes from this enum.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Tenant registry in the master database
    ConfigEmpresas,
    VenFacturas,
    VenCotizaciones,
    VenPedidos,
    VenRemisiones,
    InvProductos,
    InvKardex,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::ConfigEmpresas,
        Table::VenFacturas,
        Table::VenCotizaciones,
        Table::VenPedidos,
        Table::VenRemisiones,
        Table::InvProductos,
        Table::InvKardex,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Table::ConfigEmpresas => "config_empresas",
            Table::VenFacturas => "ven_facturas",
            Table::VenCotizaciones => "ven_cotizaciones",
            Table::VenPedidos => "ven_pedidos",
            Table::VenRemisiones => "ven_remisiones",
            Table::InvProductos => "inv_productos",
            Table::InvKardex => "inv_kardex",
        }
    }

    /// Look up a table by name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Table> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique_snake_case() {
        let mut names: Vec<_> = Table::ALL.iter().map(|t| t.name()).collect();
        assert!(names.iter().all(|n| n.chars().all(|c| c.is_ascii_lowercase() || c == '_')));
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Table::ALL.len());
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Table::from_name("VEN_FACTURAS"), Some(Table::VenFacturas));
        assert_eq!(Table::from_name("ven_facturas; DROP TABLE x"), None);
        assert_eq!(format!("SELECT * FROM {}", Table::InvKardex), "SELECT * FROM inv_kardex");
    }
}
