//! Federation catalog
//!
//! Immutable mapping of federated local tables to their foreign-table
//! counterpart on the fresh store. Built by the bootstrap, then shared
//! read-only. A rebuild produces a new catalog that replaces the old one
//! through [`SharedCatalog::swap`].

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One column of a federated table, in production's ordinal order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FederatedColumn {
    pub name: String,
    /// Type as rendered by `format_type()` on production
    pub data_type: String,
}

impl FederatedColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A local table federated with a foreign table pointing at production
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FederationEntry {
    pub local_table: String,
    pub foreign_table: String,
    pub columns: Vec<FederatedColumn>,
    pub identity_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("federated table '{0}' has no columns")]
    EmptyColumns(String),

    #[error("identity column '{identity}' is not a column of '{table}'")]
    MissingIdentity { table: String, identity: String },

    #[error("federated table '{0}' registered twice")]
    Duplicate(String),
}

impl FederationEntry {
    /// Column names in registration order
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Check the entry's structural invariants
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.columns.is_empty() {
            return Err(CatalogError::EmptyColumns(self.local_table.clone()));
        }
        if !self.has_column(&self.identity_column) {
            return Err(CatalogError::MissingIdentity {
                table: self.local_table.clone(),
                identity: self.identity_column.clone(),
            });
        }
        Ok(())
    }
}

/// Local table name → federation entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FederationCatalog {
    entries: BTreeMap<String, FederationEntry>,
}

impl FederationCatalog {
    /// Catalog with no federated tables (degraded mode)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a catalog from validated entries; keys must be unique
    pub fn from_entries(
        entries: impl IntoIterator<Item = FederationEntry>,
    ) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for entry in entries {
            entry.validate()?;
            let key = entry.local_table.clone();
            if map.contains_key(&key) {
                return Err(CatalogError::Duplicate(key));
            }
            map.insert(key, entry);
        }
        Ok(Self { entries: map })
    }

    /// Lookup by normalized local table name
    pub fn get(&self, local_table: &str) -> Option<&FederationEntry> {
        self.entries.get(local_table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FederationEntry> {
        self.entries.values()
    }

    /// Build without validation, for exercising consumers against bad entries
    #[cfg(test)]
    pub(crate) fn from_entries_unchecked(entries: impl IntoIterator<Item = FederationEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.local_table.clone(), e))
                .collect(),
        }
    }
}

/// Process-wide catalog reference with atomic replacement
///
/// Readers clone the inner `Arc` under a short read lock and never hold the
/// lock across I/O.
#[derive(Debug, Default)]
pub struct SharedCatalog {
    current: RwLock<Arc<FederationCatalog>>,
}

impl SharedCatalog {
    pub fn new(catalog: FederationCatalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog)),
        }
    }

    /// Snapshot of the current catalog
    pub fn load(&self) -> Arc<FederationCatalog> {
        self.current.read().clone()
    }

    /// Replace the catalog, returning the previous one
    pub fn swap(&self, catalog: FederationCatalog) -> Arc<FederationCatalog> {
        std::mem::replace(&mut *self.current.write(), Arc::new(catalog))
    }
}

#[cfg(test)]
pub(crate) fn users_entry() -> FederationEntry {
    FederationEntry {
        local_table: "users".into(),
        foreign_table: "users_production".into(),
        columns: vec![
            FederatedColumn::new("id", "integer"),
            FederatedColumn::new("name", "text"),
        ],
        identity_column: "id".into(),
    }
}
