//! Registry of code migrations compiled into the binary.
//!
//! The process bootstrap owns one registry and hands it to the collector.

use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::migration::{CodeMigration, Migration, MigrationFn};
use crate::version::{parse_version, version_from_filename};
use std::path::Path;

/// Code migrations keyed by version identifier
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<String, CodeMigration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration that runs inside a transaction.
    ///
    /// `source` is the version identifier or the migration's file name
    /// (`m210131_171852_add_user_table.rs`).
    pub fn register(
        &mut self,
        source: &str,
        up: Option<MigrationFn>,
        down: Option<MigrationFn>,
    ) -> EngineResult<&mut Self> {
        self.insert(source, up, down, true)
    }

    /// Register a migration that runs directly on a connection
    pub fn register_non_transactional(
        &mut self,
        source: &str,
        up: Option<MigrationFn>,
        down: Option<MigrationFn>,
    ) -> EngineResult<&mut Self> {
        self.insert(source, up, down, false)
    }

    fn insert(
        &mut self,
        source: &str,
        up: Option<MigrationFn>,
        down: Option<MigrationFn>,
        transactional: bool,
    ) -> EngineResult<&mut Self> {
        let version = identifier_from_source(source)?;
        if self.migrations.contains_key(&version) {
            return Err(EngineError::DuplicateVersion { version });
        }

        self.migrations.insert(
            version,
            CodeMigration {
                up,
                down,
                transactional,
            },
        );
        Ok(self)
    }

    pub fn contains(&self, version: &str) -> bool {
        self.migrations.contains_key(version)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Build a migration for every registration
    pub fn migrations(&self) -> EngineResult<Vec<Migration>> {
        self.migrations
            .iter()
            .map(|(version, code)| Migration::code(version, code.clone()))
            .collect()
    }
}

fn identifier_from_source(source: &str) -> EngineResult<String> {
    let path = Path::new(source);
    let version = if path.extension().is_some() {
        version_from_filename(path)?
    } else {
        source.to_string()
    };
    parse_version(&version)?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::migration_fn;

    fn noop() -> MigrationFn {
        migration_fn(|_db| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_register_by_identifier_and_file_name() {
        let mut registry = MigrationRegistry::new();
        registry
            .register("m200101_000000_add_accounts_table", Some(noop()), None)
            .unwrap()
            .register_non_transactional(
                "migrations/m200102_000000_add_index.rs",
                Some(noop()),
                Some(noop()),
            )
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("m200102_000000_add_index"));

        let migrations = registry.migrations().unwrap();
        assert!(migrations.iter().all(|m| m.registered));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = MigrationRegistry::new();
        registry
            .register("m200101_000000_a", Some(noop()), None)
            .unwrap();
        let err = registry
            .register("m200101_000000_a.rs", None, Some(noop()))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateVersion { .. }));
    }

    #[test]
    fn test_invalid_sources_are_rejected() {
        let mut registry = MigrationRegistry::new();
        assert!(matches!(
            registry.register("not_a_version", None, None),
            Err(EngineError::InvalidVersionFormat { .. })
        ));
        assert!(matches!(
            registry.register("m200101_000000_a.txt", None, None),
            Err(EngineError::UnsupportedExtension { .. })
        ));
        assert!(registry.is_empty());
    }
}
