//! # gomigrate-engine: Versioned schema migrations
//!
//! Discovers migrations from a directory of annotated SQL scripts and from code
//! registered at startup, orders them by version, and applies or reverts them
//! while keeping a ledger table in the target database.
//!
//! Concurrent runners coordinate through the ledger itself: a migration is
//! claimed with a provisional ledger row before its body runs, so two processes
//! migrating the same database never execute the same migration twice.

pub mod collection;
pub mod collector;
pub mod definitions;
pub mod error;
pub mod ledger;
pub mod migration;
pub mod migrator;
pub mod parser;
pub mod registry;
pub mod runner;
pub mod template;
pub mod version;

pub use collection::MigrationSet;
pub use collector::Collector;
pub use definitions::*;
pub use error::{EngineError, EngineResult};
pub use ledger::{
    Acquire, Executor, FailPoint, Ledger, LedgerSession, LedgerTransaction, MemoryLedger,
    PostgresDialect, PostgresLedger,
};
pub use migration::{
    migration_fn, CodeMigration, Migration, MigrationFn, MigrationFuture, MigrationKind,
    MigrationSource, StepAction, StepPlan,
};
pub use migrator::{MarkPlan, Migrator, TargetPlan};
pub use parser::{ParseError, ParsedScript, ScriptParser};
pub use registry::MigrationRegistry;
pub use runner::Runner;
pub use template::{create_migration, TemplateKind};
pub use version::{build_version, in_range, is_valid_version, parse_version, version_from_filename};
