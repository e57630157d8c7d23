//! Collector - discovers migrations in a directory and in the registry
//!
//! Sources, in order: `.sql` scripts, registered code migrations, and `.rs` files
//! that no registration covers. The result is sorted by comparable key and may be
//! restricted to an inclusive key range.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::collection::MigrationSet;
use crate::definitions::DEFAULT_DIRECTIVE_TOOL;
use crate::error::{EngineError, EngineResult};
use crate::ledger::Ledger;
use crate::migration::Migration;
use crate::parser::ScriptParser;
use crate::registry::MigrationRegistry;
use crate::version::{in_range, parse_version, version_from_filename, CODE_EXTENSION, SCRIPT_EXTENSION};

/// Builds migration collections from a directory plus registered code
#[derive(Debug, Clone)]
pub struct Collector {
    directory: PathBuf,
    registry: Arc<MigrationRegistry>,
    parser: ScriptParser,
}

impl Collector {
    pub fn new(directory: impl Into<PathBuf>, registry: Arc<MigrationRegistry>) -> Self {
        Self {
            directory: directory.into(),
            registry,
            parser: ScriptParser::new(DEFAULT_DIRECTIVE_TOOL),
        }
    }

    /// Recognise `-- +<tool>` directives instead of the default marker
    pub fn with_directive_tool(mut self, tool: impl Into<String>) -> Self {
        self.parser = ScriptParser::new(tool);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Every migration whose key lies in `[low, high]` (either bound order);
    /// `0, 0` returns everything.
    pub fn collect(&self, low: u64, high: u64) -> EngineResult<MigrationSet> {
        if !self.directory.is_dir() {
            return Err(EngineError::DirectoryNotFound {
                path: self.directory.clone(),
            });
        }

        let mut migrations = Vec::new();

        for path in self.files_with_extension(SCRIPT_EXTENSION)? {
            let version = version_from_filename(&path)?;
            if in_range(parse_version(&version)?, low, high) {
                migrations.push(Migration::script(&version, path, self.parser.clone())?);
            }
        }

        for migration in self.registry.migrations()? {
            if in_range(migration.key, low, high) {
                migrations.push(migration);
            }
        }

        for path in self.files_with_extension(CODE_EXTENSION)? {
            let version = version_from_filename(&path)?;
            if self.registry.contains(&version) {
                continue;
            }
            if in_range(parse_version(&version)?, low, high) {
                migrations.push(Migration::unregistered(&version, path)?);
            }
        }

        debug!(
            directory = %self.directory.display(),
            low,
            high,
            count = migrations.len(),
            "Collected migrations"
        );
        MigrationSet::new(migrations)
    }

    /// Discovered migrations minus every version present in the ledger.
    ///
    /// Creates the ledger when missing and reads it fresh on every call.
    pub async fn new_migrations(&self, ledger: &dyn Ledger) -> EngineResult<MigrationSet> {
        ledger.ensure_ledger().await?;
        let applied = ledger.applied_set().await?;

        let mut migrations = self.collect(0, 0)?;
        migrations.retain(|m| !applied.contains_key(&m.version));
        Ok(migrations)
    }

    fn files_with_extension(&self, extension: &str) -> EngineResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == extension) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::migration::{migration_fn, MigrationKind};
    use tempfile::TempDir;

    const SCRIPT: &str = "-- +gomigrate Up\nSELECT 1;\n-- +gomigrate Down\nSELECT 2;\n";

    fn write(dir: &TempDir, name: &str) {
        fs::write(dir.path().join(name), SCRIPT).unwrap();
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(&dir, "m200103_000000_third.sql");
        write(&dir, "m200101_000000_first.sql");
        write(&dir, "m200102_000000_second.sql");
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();
        dir
    }

    #[test]
    fn test_collect_everything_sorted() {
        let dir = fixture();
        let collector = Collector::new(dir.path(), Arc::new(MigrationRegistry::new()));

        let all = collector.collect(0, 0).unwrap();
        assert_eq!(
            all.versions(),
            vec![
                "m200101_000000_first",
                "m200102_000000_second",
                "m200103_000000_third"
            ]
        );
    }

    #[test]
    fn test_collect_ranges() {
        let dir = fixture();
        let collector = Collector::new(dir.path(), Arc::new(MigrationRegistry::new()));

        let single = collector.collect(200102000000, 200102000000).unwrap();
        assert_eq!(single.versions(), vec!["m200102_000000_second"]);

        let upward = collector.collect(200102000000, 200103000000).unwrap();
        let downward = collector.collect(200103000000, 200102000000).unwrap();
        assert_eq!(upward.versions(), downward.versions());
        assert_eq!(upward.len(), 2);
    }

    #[test]
    fn test_missing_directory() {
        let collector = Collector::new("/definitely/not/here", Arc::new(MigrationRegistry::new()));
        assert!(matches!(
            collector.collect(0, 0),
            Err(EngineError::DirectoryNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_script_name_aborts_collection() {
        let dir = fixture();
        write(&dir, "create_users.sql");
        let collector = Collector::new(dir.path(), Arc::new(MigrationRegistry::new()));
        assert!(matches!(
            collector.collect(0, 0),
            Err(EngineError::InvalidVersionFormat { .. })
        ));
    }

    #[test]
    fn test_registered_and_loose_code_migrations() {
        let dir = fixture();
        fs::write(dir.path().join("m200104_000000_code.rs"), "// registered").unwrap();
        fs::write(dir.path().join("m200105_000000_loose.rs"), "// not registered").unwrap();

        let mut registry = MigrationRegistry::new();
        registry
            .register(
                "m200104_000000_code",
                Some(migration_fn(|_db| Box::pin(async { Ok(()) }))),
                None,
            )
            .unwrap();
        let collector = Collector::new(dir.path(), Arc::new(registry));

        let all = collector.collect(0, 0).unwrap();
        assert_eq!(all.len(), 5);

        let code = all.get("m200104_000000_code").unwrap();
        assert!(code.registered);
        assert!(matches!(code.kind, MigrationKind::Code(_)));

        let loose = all.get("m200105_000000_loose").unwrap();
        assert!(!loose.registered);
        assert!(matches!(loose.kind, MigrationKind::Unregistered));
    }

    #[test]
    fn test_script_and_registration_sharing_a_version() {
        let dir = fixture();
        let mut registry = MigrationRegistry::new();
        registry
            .register("m200101_000000_first", None, None)
            .unwrap();
        let collector = Collector::new(dir.path(), Arc::new(registry));

        assert!(matches!(
            collector.collect(0, 0),
            Err(EngineError::DuplicateVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_new_migrations_subtracts_ledger() {
        let dir = fixture();
        let collector = Collector::new(dir.path(), Arc::new(MigrationRegistry::new()));
        let ledger = MemoryLedger::new();

        let pending = collector.new_migrations(&ledger).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(ledger.row_count(), 1);

        ledger.seed("m200101_000000_first", Some(100));
        // Provisional rows are in flight elsewhere and are not new either.
        ledger.seed("m200102_000000_second", None);

        let pending = collector.new_migrations(&ledger).await.unwrap();
        assert_eq!(pending.versions(), vec!["m200103_000000_third"]);
    }
}
