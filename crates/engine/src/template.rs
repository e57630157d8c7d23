//! Migration file templates
//!
//! Creates new, timestamped migration files in the migrations directory.

use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::version::{build_version, filename_for, CODE_EXTENSION, SCRIPT_EXTENSION};

/// Kind of migration file to create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateKind {
    /// Annotated SQL script
    #[default]
    Sql,
    /// Rust module registering a code migration
    Rust,
}

impl TemplateKind {
    pub fn extension(&self) -> &'static str {
        match self {
            TemplateKind::Sql => SCRIPT_EXTENSION,
            TemplateKind::Rust => CODE_EXTENSION,
        }
    }

    /// File content for a new migration `version`
    pub fn render(&self, version: &str, tool: &str, created: DateTime<Utc>) -> String {
        match self {
            TemplateKind::Sql => sql_template(tool),
            TemplateKind::Rust => rust_template(version, created),
        }
    }
}

impl FromStr for TemplateKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sql" => Ok(TemplateKind::Sql),
            "rs" | "rust" | "code" => Ok(TemplateKind::Rust),
            other => Err(EngineError::custom(format!(
                "unknown migration template '{}', expected 'sql' or 'rs'",
                other
            ))),
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Write a new migration named `name` into `directory`.
///
/// The directory is created when missing. An existing file is never overwritten.
/// Returns the path of the new file.
pub fn create_migration(
    directory: &Path,
    name: &str,
    kind: TemplateKind,
    tool: &str,
    now: DateTime<Utc>,
) -> EngineResult<PathBuf> {
    let version = build_version(now, name)?;

    fs::create_dir_all(directory)?;
    let path = directory.join(filename_for(&version, kind.extension()));

    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    file.write_all(kind.render(&version, tool, now).as_bytes())?;

    info!("New migration created successfully: {}", path.display());
    Ok(path)
}

fn sql_template(tool: &str) -> String {
    format!(
        "-- +{tool} Up\n\
         -- +{tool} StatementBegin\n\
         SELECT 'up SQL query';\n\
         -- +{tool} StatementEnd\n\
         \n\
         -- +{tool} Down\n\
         -- +{tool} StatementBegin\n\
         SELECT 'down SQL query';\n\
         -- +{tool} StatementEnd\n"
    )
}

fn rust_template(version: &str, created: DateTime<Utc>) -> String {
    format!(
        "//! Migration {version}\n\
         //! Created: {created}\n\
         \n\
         use gomigrate_engine::{{migration_fn, EngineResult, Executor, MigrationFuture, MigrationRegistry}};\n\
         \n\
         pub fn register(registry: &mut MigrationRegistry) -> EngineResult<()> {{\n\
         \x20   registry.register(\"{version}\", Some(migration_fn(up)), Some(migration_fn(down)))?;\n\
         \x20   Ok(())\n\
         }}\n\
         \n\
         fn up(db: &mut dyn Executor) -> MigrationFuture<'_> {{\n\
         \x20   Box::pin(async move {{\n\
         \x20       db.execute(\"SELECT 'up SQL query'\").await?;\n\
         \x20       Ok(())\n\
         \x20   }})\n\
         }}\n\
         \n\
         fn down(db: &mut dyn Executor) -> MigrationFuture<'_> {{\n\
         \x20   Box::pin(async move {{\n\
         \x20       db.execute(\"SELECT 'down SQL query'\").await?;\n\
         \x20       Ok(())\n\
         \x20   }})\n\
         }}\n",
        version = version,
        created = created.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}
