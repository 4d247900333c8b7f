//! Tenant records as stored in the master database.

use serde::{Deserialize, Serialize};

/// One onboarded company and the physical database that holds its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Company code, matched exactly (ignoring case) or as a substring.
    pub tenant_key: String,
    /// Commercial name, e.g. "Orquidea Flowers S.A."; used for fuzzy lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commercial_name: Option<String>,
    pub database_name: String,
    pub active: bool,
}

impl TenantRecord {
    /// Create an active tenant record.
    pub fn new(tenant_key: impl Into<String>, database_name: impl Into<String>) -> Self {
        Self {
            tenant_key: tenant_key.into(),
            commercial_name: None,
            database_name: database_name.into(),
            active: true,
        }
    }

    pub fn with_commercial_name(mut self, name: impl Into<String>) -> Self {
        self.commercial_name = Some(name.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Active records must point at a database.
    pub fn is_valid(&self) -> bool {
        !self.active || !self.database_name.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_record_requires_database() {
        assert!(TenantRecord::new("ORQ", "orquidea").is_valid());
        assert!(!TenantRecord::new("ORQ", " ").is_valid());
        assert!(TenantRecord::new("OLD", "").inactive().is_valid());
    }
}
