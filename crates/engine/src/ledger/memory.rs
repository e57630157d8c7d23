//! In-memory ledger
//!
//! Keeps committed rows in a map shared by every session. Transactions buffer
//! their writes and publish them on commit. Provisional inserts and row locks are
//! held until the owning transaction ends, and a contending session gets
//! [`Acquire::Contended`] immediately instead of waiting.
//!
//! Statements run through an executor are recorded, not interpreted. Failures can
//! be injected per ledger operation with [`MemoryLedger::fail_on`] or per
//! statement with [`MemoryLedger::fail_statement`].

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Acquire, Executor, Ledger, LedgerSession, LedgerTransaction};
use crate::definitions::{now_timestamp, AppliedSet, MigrationRecord, BASE_VERSION};
use crate::error::{EngineError, EngineResult};

/// Ledger operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    Commit,
    Rollback,
    InsertFinal,
    InsertProvisional,
    UpdateApplyTime,
    DeleteRecord,
    LockRecord,
}

#[derive(Debug, Default)]
struct MemoryState {
    created: bool,
    rows: BTreeMap<String, Option<i64>>,
    reserved: HashSet<String>,
    locked: HashSet<String>,
    executed: Vec<String>,
    fail_points: HashSet<FailPoint>,
    failing_statements: Vec<String>,
}

impl MemoryState {
    fn check(&self, point: FailPoint) -> EngineResult<()> {
        if self.fail_points.contains(&point) {
            return Err(EngineError::custom(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }

    fn check_statement(&self, sql: &str) -> EngineResult<()> {
        if let Some(pattern) = self
            .failing_statements
            .iter()
            .find(|pattern| sql.contains(pattern.as_str()))
        {
            return Err(EngineError::custom(format!(
                "injected failure for statement matching '{}'",
                pattern
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Insert(String, Option<i64>),
    Stamp(String, i64),
    Delete(String),
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ledger kept in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future call of `point` fail
    pub fn fail_on(&self, point: FailPoint) {
        lock_state(&self.state).fail_points.insert(point);
    }

    /// Make statements containing `pattern` fail
    pub fn fail_statement(&self, pattern: impl Into<String>) {
        lock_state(&self.state).failing_statements.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        let mut state = lock_state(&self.state);
        state.fail_points.clear();
        state.failing_statements.clear();
    }

    /// Committed statements in execution order
    pub fn executed(&self) -> Vec<String> {
        lock_state(&self.state).executed.clone()
    }

    /// Committed row for `version`: `None` if absent, `Some(None)` if provisional
    pub fn row(&self, version: &str) -> Option<Option<i64>> {
        lock_state(&self.state).rows.get(version).cloned()
    }

    /// Number of committed rows, base row included
    pub fn row_count(&self) -> usize {
        lock_state(&self.state).rows.len()
    }

    /// Write a row directly, bypassing sessions
    pub fn seed(&self, version: &str, apply_time: Option<i64>) {
        lock_state(&self.state)
            .rows
            .insert(version.to_string(), apply_time);
    }

    fn apply(state: &mut MemoryState, write: PendingWrite) {
        match write {
            PendingWrite::Insert(version, apply_time) => {
                state.rows.insert(version, apply_time);
            }
            PendingWrite::Stamp(version, apply_time) => {
                if let Some(row) = state.rows.get_mut(&version) {
                    *row = Some(apply_time);
                }
            }
            PendingWrite::Delete(version) => {
                state.rows.remove(&version);
            }
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn ensure_ledger(&self) -> EngineResult<()> {
        let mut state = lock_state(&self.state);
        if !state.created {
            state.created = true;
            state
                .rows
                .entry(BASE_VERSION.to_string())
                .or_insert(Some(now_timestamp()));
        }
        Ok(())
    }

    async fn history(&self, limit: Option<usize>) -> EngineResult<Vec<MigrationRecord>> {
        let state = lock_state(&self.state);
        let mut records: Vec<MigrationRecord> = state
            .rows
            .iter()
            .filter(|(version, _)| version.as_str() != BASE_VERSION)
            .filter_map(|(version, apply_time)| {
                apply_time.map(|apply_time| MigrationRecord::new(version.clone(), apply_time))
            })
            .collect();

        records.sort_by(|a, b| {
            b.apply_time
                .cmp(&a.apply_time)
                .then_with(|| b.version.cmp(&a.version))
        });
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn applied_set(&self) -> EngineResult<AppliedSet> {
        let state = lock_state(&self.state);
        Ok(state
            .rows
            .iter()
            .filter(|(version, _)| version.as_str() != BASE_VERSION)
            .map(|(version, apply_time)| (version.clone(), *apply_time))
            .collect())
    }

    async fn connection(&self) -> EngineResult<Box<dyn LedgerSession>> {
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
        }))
    }

    async fn begin(&self) -> EngineResult<Box<dyn LedgerTransaction>> {
        lock_state(&self.state).check(FailPoint::Begin)?;
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            writes: Vec::new(),
            statements: Vec::new(),
            reserved: Vec::new(),
            locked: Vec::new(),
        }))
    }
}

/// Autocommit session: every write is published immediately
pub struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl Executor for MemorySession {
    async fn execute(&mut self, sql: &str) -> EngineResult<u64> {
        let mut state = lock_state(&self.state);
        state.check_statement(sql)?;
        state.executed.push(sql.to_string());
        Ok(0)
    }
}

#[async_trait]
impl LedgerSession for MemorySession {
    async fn insert_final_record(&mut self, version: &str) -> EngineResult<()> {
        let mut state = lock_state(&self.state);
        state.check(FailPoint::InsertFinal)?;
        if state.rows.contains_key(version) || state.reserved.contains(version) {
            return Err(EngineError::custom(format!("duplicate ledger row {}", version)));
        }
        state.rows.insert(version.to_string(), Some(now_timestamp()));
        Ok(())
    }

    async fn try_insert_provisional_record(&mut self, version: &str) -> EngineResult<Acquire> {
        let mut state = lock_state(&self.state);
        state.check(FailPoint::InsertProvisional)?;
        if state.rows.contains_key(version) || state.reserved.contains(version) {
            return Ok(Acquire::Contended);
        }
        state.rows.insert(version.to_string(), None);
        Ok(Acquire::Acquired)
    }

    async fn update_apply_time(&mut self, version: &str) -> EngineResult<()> {
        let mut state = lock_state(&self.state);
        state.check(FailPoint::UpdateApplyTime)?;
        match state.rows.get_mut(version) {
            Some(row) => {
                *row = Some(now_timestamp());
                Ok(())
            }
            None => Err(EngineError::custom(format!("no ledger row to stamp for {}", version))),
        }
    }

    async fn delete_record(&mut self, version: &str) -> EngineResult<()> {
        let mut state = lock_state(&self.state);
        state.check(FailPoint::DeleteRecord)?;
        state.rows.remove(version);
        Ok(())
    }

    async fn try_lock_record(&mut self, version: &str) -> EngineResult<Acquire> {
        let state = lock_state(&self.state);
        state.check(FailPoint::LockRecord)?;
        // Autocommit: the lock would be released at once.
        if !state.rows.contains_key(version) || state.locked.contains(version) {
            return Ok(Acquire::Contended);
        }
        Ok(Acquire::Acquired)
    }

    fn executor(&mut self) -> &mut dyn Executor {
        self
    }
}

/// Transaction: writes are buffered until commit
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    writes: Vec<PendingWrite>,
    statements: Vec<String>,
    reserved: Vec<String>,
    locked: Vec<String>,
}

impl MemoryTransaction {
    fn release(&mut self, state: &mut MemoryState) {
        for version in self.reserved.drain(..) {
            state.reserved.remove(&version);
        }
        for version in self.locked.drain(..) {
            state.locked.remove(&version);
        }
        self.writes.clear();
        self.statements.clear();
    }

    /// Whether this transaction's own buffered writes leave a row for `version`
    fn sees_row(&self, committed: bool, version: &str) -> bool {
        self.writes.iter().fold(committed, |present, write| match write {
            PendingWrite::Insert(v, _) if v == version => true,
            PendingWrite::Delete(v) if v == version => false,
            _ => present,
        })
    }
}

#[async_trait]
impl Executor for MemoryTransaction {
    async fn execute(&mut self, sql: &str) -> EngineResult<u64> {
        lock_state(&self.state).check_statement(sql)?;
        self.statements.push(sql.to_string());
        Ok(0)
    }
}

#[async_trait]
impl LedgerSession for MemoryTransaction {
    async fn insert_final_record(&mut self, version: &str) -> EngineResult<()> {
        let mut state = lock_state(&self.state);
        state.check(FailPoint::InsertFinal)?;
        let committed = state.rows.contains_key(version);
        if self.sees_row(committed, version) || state.reserved.contains(version) {
            return Err(EngineError::custom(format!("duplicate ledger row {}", version)));
        }
        state.reserved.insert(version.to_string());
        drop(state);
        self.reserved.push(version.to_string());
        self.writes
            .push(PendingWrite::Insert(version.to_string(), Some(now_timestamp())));
        Ok(())
    }

    async fn try_insert_provisional_record(&mut self, version: &str) -> EngineResult<Acquire> {
        let mut state = lock_state(&self.state);
        state.check(FailPoint::InsertProvisional)?;
        let committed = state.rows.contains_key(version);
        if self.sees_row(committed, version) || state.reserved.contains(version) {
            return Ok(Acquire::Contended);
        }
        state.reserved.insert(version.to_string());
        drop(state);
        self.reserved.push(version.to_string());
        self.writes.push(PendingWrite::Insert(version.to_string(), None));
        Ok(Acquire::Acquired)
    }

    async fn update_apply_time(&mut self, version: &str) -> EngineResult<()> {
        let state = lock_state(&self.state);
        state.check(FailPoint::UpdateApplyTime)?;
        let committed = state.rows.contains_key(version);
        drop(state);
        if !self.sees_row(committed, version) {
            return Err(EngineError::custom(format!("no ledger row to stamp for {}", version)));
        }
        self.writes
            .push(PendingWrite::Stamp(version.to_string(), now_timestamp()));
        Ok(())
    }

    async fn delete_record(&mut self, version: &str) -> EngineResult<()> {
        lock_state(&self.state).check(FailPoint::DeleteRecord)?;
        self.writes.push(PendingWrite::Delete(version.to_string()));
        Ok(())
    }

    async fn try_lock_record(&mut self, version: &str) -> EngineResult<Acquire> {
        let mut state = lock_state(&self.state);
        state.check(FailPoint::LockRecord)?;
        if self.locked.iter().any(|v| v == version) {
            return Ok(Acquire::Acquired);
        }
        if !state.rows.contains_key(version) || state.locked.contains(version) {
            return Ok(Acquire::Contended);
        }
        state.locked.insert(version.to_string());
        drop(state);
        self.locked.push(version.to_string());
        Ok(Acquire::Acquired)
    }

    fn executor(&mut self) -> &mut dyn Executor {
        self
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> EngineResult<()> {
        let mut tx = self;
        let state_handle = Arc::clone(&tx.state);
        let mut state = lock_state(&state_handle);
        if let Err(err) = state.check(FailPoint::Commit) {
            tx.release(&mut state);
            return Err(err);
        }

        for write in std::mem::take(&mut tx.writes) {
            MemoryLedger::apply(&mut state, write);
        }
        let statements = std::mem::take(&mut tx.statements);
        state.executed.extend(statements);
        tx.release(&mut state);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        let mut tx = self;
        let state_handle = Arc::clone(&tx.state);
        let mut state = lock_state(&state_handle);
        // Reservations are dropped even when the rollback reports failure.
        tx.release(&mut state);
        state.check(FailPoint::Rollback)
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.reserved.is_empty() && self.locked.is_empty() {
            return;
        }
        let state_handle = Arc::clone(&self.state);
        let mut state = lock_state(&state_handle);
        self.release(&mut state);
    }
}
