//! Persistence contract for the applied-migrations ledger
//!
//! The runner and collector only talk to the ledger through these traits.
//! Lock acquisition is an explicit try-acquire returning [`Acquire`], so a backend
//! may implement it with a unique constraint, a row lock or an advisory lock.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::definitions::{AppliedSet, MigrationRecord};
use crate::error::EngineResult;

pub use memory::{FailPoint, MemoryLedger};
pub use postgres::{PostgresDialect, PostgresLedger};

/// Result of a non-blocking acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    /// Another session holds or has completed this version
    Contended,
}

impl Acquire {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquire::Acquired)
    }
}

/// Runs SQL on behalf of migration bodies
#[async_trait]
pub trait Executor: Send {
    /// Execute one statement and return the number of affected rows
    async fn execute(&mut self, sql: &str) -> EngineResult<u64>;
}

/// A connection or an open transaction able to mutate the ledger
#[async_trait]
pub trait LedgerSession: Executor {
    /// Insert a finalized row stamped with the current time
    async fn insert_final_record(&mut self, version: &str) -> EngineResult<()>;

    /// Insert a row with no apply time. `Contended` when the version already exists.
    async fn try_insert_provisional_record(&mut self, version: &str) -> EngineResult<Acquire>;

    /// Stamp a provisional row with the current time
    async fn update_apply_time(&mut self, version: &str) -> EngineResult<()>;

    async fn delete_record(&mut self, version: &str) -> EngineResult<()>;

    /// Non-blocking row lock. `Contended` when the row is locked elsewhere or missing.
    async fn try_lock_record(&mut self, version: &str) -> EngineResult<Acquire>;

    /// This session as a plain executor for migration bodies
    fn executor(&mut self) -> &mut dyn Executor;
}

/// A ledger session inside an explicit transaction
#[async_trait]
pub trait LedgerTransaction: LedgerSession {
    async fn commit(self: Box<Self>) -> EngineResult<()>;

    async fn rollback(self: Box<Self>) -> EngineResult<()>;
}

/// Root handle to the ledger
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create the ledger table with the base row if it does not exist
    async fn ensure_ledger(&self) -> EngineResult<()>;

    /// Finalized rows, newest first, base row excluded
    async fn history(&self, limit: Option<usize>) -> EngineResult<Vec<MigrationRecord>>;

    /// Every non-base row including provisional ones
    async fn applied_set(&self) -> EngineResult<AppliedSet>;

    /// Autocommit session
    async fn connection(&self) -> EngineResult<Box<dyn LedgerSession>>;

    async fn begin(&self) -> EngineResult<Box<dyn LedgerTransaction>>;
}
