//! Migration Runner - applies or reverts one migration
//!
//! Transactional migrations claim their version before running:
//!
//! * up: insert a provisional ledger row inside the transaction. If the row
//!   already exists another process owns the version and the step is skipped.
//!   On failure the transaction is rolled back and a second transaction removes
//!   any provisional row that survived.
//! * down: lock the ledger row with a non-blocking lock. If the lock is not
//!   available the step is skipped.
//!
//! Non-transactional migrations run directly on a connection and only touch the
//! ledger after the body succeeded.

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::definitions::{Direction, StepOutcome};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Acquire, Ledger, LedgerTransaction};
use crate::migration::{Migration, StepAction, StepPlan};

/// Executes single migration steps against a ledger
#[derive(Clone)]
pub struct Runner {
    ledger: Arc<dyn Ledger>,
}

impl Runner {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Apply `migration`
    pub async fn apply(&self, migration: &Migration) -> EngineResult<StepOutcome> {
        self.run(migration, Direction::Up).await
    }

    /// Revert `migration`
    pub async fn revert(&self, migration: &Migration) -> EngineResult<StepOutcome> {
        self.run(migration, Direction::Down).await
    }

    /// Run `migration` in `direction` with the strategy its plan asks for
    pub async fn run(&self, migration: &Migration, direction: Direction) -> EngineResult<StepOutcome> {
        let plan = migration.plan(direction)?;
        let step = Step::new(migration, direction);

        let result = match (plan.transactional, direction) {
            (true, Direction::Up) => self.apply_safe(&step, &plan).await,
            (true, Direction::Down) => self.revert_safe(&step, &plan).await,
            (false, Direction::Up) => self.apply_unsafe(&step, &plan).await,
            (false, Direction::Down) => self.revert_unsafe(&step, &plan).await,
        };

        match &result {
            Ok(outcome) => step.log_outcome(*outcome, &plan),
            Err(err) => step.log_failure(err),
        }
        result
    }

    async fn apply_safe(&self, step: &Step<'_>, plan: &StepPlan) -> EngineResult<StepOutcome> {
        let version = step.version();
        info!("***[TRANSACTIONAL] applying {}", step.source);

        let mut tx = self.begin(version).await?;

        let claim = tx.try_insert_provisional_record(version).await;
        let claim = match claim {
            Ok(claim) => claim,
            Err(err) => {
                let err = EngineError::ledger_write(version, err);
                return Err(self.rollback_after(tx, version, err).await);
            }
        };
        if claim == Acquire::Contended {
            warn!(
                "Version {} is being applied by another process, skipping",
                version
            );
            self.rollback(tx, version).await?;
            return Ok(StepOutcome::Skipped);
        }

        let body = plan.action.run(tx.executor()).await;
        if let Err(err) = body {
            let err = EngineError::function(version, step.direction, err);
            return Err(self.rollback_and_cleanup(tx, version, err).await);
        }

        let stamp = tx.update_apply_time(version).await;
        if let Err(err) = stamp {
            let err = EngineError::ledger_write(version, err);
            return Err(self.rollback_and_cleanup(tx, version, err).await);
        }

        self.commit(tx, version).await?;
        Ok(step.completed(plan))
    }

    async fn revert_safe(&self, step: &Step<'_>, plan: &StepPlan) -> EngineResult<StepOutcome> {
        let version = step.version();
        info!("***[TRANSACTIONAL] reverting {}", step.source);

        let mut tx = self.begin(version).await?;

        let lock = tx.try_lock_record(version).await;
        let lock = match lock {
            Ok(lock) => lock,
            Err(err) => {
                let err = EngineError::ledger_write(version, err);
                return Err(self.rollback_after(tx, version, err).await);
            }
        };
        if lock == Acquire::Contended {
            warn!(
                "Version {} is being reverted by another process, skipping",
                version
            );
            self.rollback(tx, version).await?;
            return Ok(StepOutcome::Skipped);
        }

        let body = plan.action.run(tx.executor()).await;
        if let Err(err) = body {
            let err = EngineError::function(version, step.direction, err);
            return Err(self.rollback_after(tx, version, err).await);
        }

        let delete = tx.delete_record(version).await;
        if let Err(err) = delete {
            let err = EngineError::ledger_write(version, err);
            return Err(self.rollback_after(tx, version, err).await);
        }

        self.commit(tx, version).await?;
        Ok(step.completed(plan))
    }

    async fn apply_unsafe(&self, step: &Step<'_>, plan: &StepPlan) -> EngineResult<StepOutcome> {
        let version = step.version();
        warn!("***[NON-TRANSACTIONAL] applying {}", step.source);

        let mut conn = self.ledger.connection().await?;
        plan.action
            .run(conn.executor())
            .await
            .map_err(|err| EngineError::function(version, step.direction, err))?;

        if let Err(err) = conn.insert_final_record(version).await {
            return Err(unrecorded(step, plan, err));
        }
        Ok(step.completed(plan))
    }

    async fn revert_unsafe(&self, step: &Step<'_>, plan: &StepPlan) -> EngineResult<StepOutcome> {
        let version = step.version();
        warn!("***[NON-TRANSACTIONAL] reverting {}", step.source);

        let mut conn = self.ledger.connection().await?;
        plan.action
            .run(conn.executor())
            .await
            .map_err(|err| EngineError::function(version, step.direction, err))?;

        if let Err(err) = conn.delete_record(version).await {
            return Err(unrecorded(step, plan, err));
        }
        Ok(step.completed(plan))
    }

    async fn begin(&self, version: &str) -> EngineResult<Box<dyn LedgerTransaction>> {
        self.ledger
            .begin()
            .await
            .map_err(|err| EngineError::transaction(version, format!("failed to begin transaction: {}", err)))
    }

    async fn commit(&self, tx: Box<dyn LedgerTransaction>, version: &str) -> EngineResult<()> {
        tx.commit().await.map_err(|err| {
            EngineError::transaction(
                version,
                format!(
                    "failed to commit transaction: {}. The ledger row may be left provisional, inspect it manually",
                    err
                ),
            )
        })
    }

    async fn rollback(&self, tx: Box<dyn LedgerTransaction>, version: &str) -> EngineResult<()> {
        tx.rollback()
            .await
            .map_err(|err| EngineError::transaction(version, format!("failed to roll back transaction: {}", err)))
    }

    /// Roll back and return `cause`, or the rollback failure if that failed too
    async fn rollback_after(
        &self,
        tx: Box<dyn LedgerTransaction>,
        version: &str,
        cause: EngineError,
    ) -> EngineError {
        match self.rollback(tx, version).await {
            Ok(()) => cause,
            Err(rollback) => EngineError::CleanupFailed {
                version: version.to_string(),
                cause: Box::new(cause),
                cleanup: Box::new(rollback),
            },
        }
    }

    /// Roll back, then delete the provisional row in a fresh transaction.
    async fn rollback_and_cleanup(
        &self,
        tx: Box<dyn LedgerTransaction>,
        version: &str,
        cause: EngineError,
    ) -> EngineError {
        let cause = self.rollback_after(tx, version, cause).await;
        if matches!(cause, EngineError::CleanupFailed { .. }) {
            return cause;
        }

        match self.delete_provisional(version).await {
            Ok(()) => cause,
            Err(cleanup) => {
                error!(
                    "Failed to remove provisional ledger row for {}: {}",
                    version, cleanup
                );
                EngineError::CleanupFailed {
                    version: version.to_string(),
                    cause: Box::new(cause),
                    cleanup: Box::new(cleanup),
                }
            }
        }
    }

    async fn delete_provisional(&self, version: &str) -> EngineResult<()> {
        let mut tx = self.begin(version).await?;
        if let Err(err) = tx.delete_record(version).await {
            return Err(self.rollback_after(tx, version, err).await);
        }
        self.commit(tx, version).await
    }
}

fn unrecorded(step: &Step<'_>, plan: &StepPlan, err: EngineError) -> EngineError {
    if matches!(plan.action, StepAction::Empty) {
        return EngineError::ledger_write(step.version(), err);
    }
    EngineError::UnrecordedSideEffects {
        version: step.version().to_string(),
        direction: step.direction,
        source: Box::new(err),
    }
}

/// Bookkeeping for one step: identity, timing and log lines
struct Step<'a> {
    migration: &'a Migration,
    direction: Direction,
    source: String,
    start: Instant,
}

impl<'a> Step<'a> {
    fn new(migration: &'a Migration, direction: Direction) -> Self {
        Self {
            migration,
            direction,
            source: migration.display_source(),
            start: Instant::now(),
        }
    }

    fn version(&self) -> &str {
        &self.migration.version
    }

    fn completed(&self, plan: &StepPlan) -> StepOutcome {
        match plan.action {
            StepAction::Empty => StepOutcome::Empty,
            _ => StepOutcome::Executed,
        }
    }

    fn verb(&self) -> &'static str {
        match self.direction {
            Direction::Up => "applied",
            Direction::Down => "reverted",
        }
    }

    fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn log_outcome(&self, outcome: StepOutcome, plan: &StepPlan) {
        match outcome {
            StepOutcome::Executed => info!(
                "*** {} {} (time: {:.3} sec.)",
                self.verb(),
                self.source,
                self.elapsed()
            ),
            StepOutcome::Empty => warn!(
                "*** {} {} with nothing to run{} (time: {:.3} sec.)",
                self.verb(),
                self.source,
                if plan.transactional { "" } else { " (non-transactional)" },
                self.elapsed()
            ),
            StepOutcome::Skipped => warn!(
                "*** skipped {} (time: {:.3} sec.)",
                self.source,
                self.elapsed()
            ),
        }
    }

    fn log_failure(&self, err: &EngineError) {
        let verb = match self.direction {
            Direction::Up => "apply",
            Direction::Down => "revert",
        };
        error!(
            "*** failed to {} {} (time: {:.3} sec.): {}",
            verb,
            self.source,
            self.elapsed(),
            err
        );
    }
}
