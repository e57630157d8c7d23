//! Error types for the migration engine

use std::path::PathBuf;
use thiserror::Error;

use crate::definitions::Direction;
use crate::parser::ParseError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while discovering, parsing or running migrations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid version format '{version}': expected m<yymmdd>_<hhmmss>_<name>")]
    InvalidVersionFormat { version: String },

    #[error("Unsupported migration file extension: {path}")]
    UnsupportedExtension { path: PathBuf },

    #[error("Malformed migration filename '{path}': expected {{version}}.{{extension}}")]
    MalformedFilename { path: PathBuf },

    #[error("Duplicate migration version: {version}")]
    DuplicateVersion { version: String },

    #[error("Migrations directory not found: {path}")]
    DirectoryNotFound { path: PathBuf },

    #[error("Failed to parse migration script {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("Migration {version} failed while running {direction}: {source}")]
    Function {
        version: String,
        direction: Direction,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Failed to write ledger record for {version}: {source}")]
    LedgerWrite {
        version: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Transaction error for {version}: {message}")]
    Transaction { version: String, message: String },

    #[error(
        "Cleanup of provisional ledger row for {version} failed ({cleanup}) after: {cause}. \
         The ledger must be inspected manually"
    )]
    CleanupFailed {
        version: String,
        cause: Box<EngineError>,
        cleanup: Box<EngineError>,
    },

    #[error(
        "Migration {version} ran {direction} without a transaction but the ledger could not be \
         updated: {source}. Inspect the schema and run `mark` to reconcile the ledger"
    )]
    UnrecordedSideEffects {
        version: String,
        direction: Direction,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Code migration {version} is not registered with the migration registry")]
    UnregisteredMigration { version: String },

    #[error("Ledger and migrations directory are inconsistent, missing sources for: {}", .versions.join(", "))]
    InconsistentLedger { versions: Vec<String> },

    #[error("Unable to find migration with version {version}")]
    VersionNotFound { version: String },

    #[error("Invalid migration name '{name}': use letters, digits, underscore and/or backslash only")]
    InvalidName { name: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Custom(String),
}

impl EngineError {
    /// Create a free-form error, for use inside code migrations
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    pub(crate) fn function(version: &str, direction: Direction, source: EngineError) -> Self {
        Self::Function {
            version: version.to_string(),
            direction,
            source: Box::new(source),
        }
    }

    pub(crate) fn ledger_write(version: &str, source: EngineError) -> Self {
        Self::LedgerWrite {
            version: version.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn transaction(version: &str, message: impl Into<String>) -> Self {
        Self::Transaction {
            version: version.to_string(),
            message: message.into(),
        }
    }

    /// Errors raised before any database mutation: identifier, layout and grammar problems
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidVersionFormat { .. }
                | EngineError::UnsupportedExtension { .. }
                | EngineError::MalformedFilename { .. }
                | EngineError::DuplicateVersion { .. }
                | EngineError::DirectoryNotFound { .. }
                | EngineError::Parse { .. }
        )
    }

    /// The ledger may disagree with the schema and needs an operator
    pub fn needs_inspection(&self) -> bool {
        matches!(
            self,
            EngineError::CleanupFailed { .. }
                | EngineError::UnrecordedSideEffects { .. }
                | EngineError::InconsistentLedger { .. }
        )
    }
}
