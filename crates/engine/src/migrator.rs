//! Migrator - batch operations over the collector, runner and ledger
//!
//! Each operation reads the ledger fresh, selects an ordered batch, validates every
//! migration in it (scripts are parsed here) and only then runs the batch one
//! migration at a time, stopping at the first failure.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::collection::MigrationSet;
use crate::collector::Collector;
use crate::definitions::{migrations_noun, BatchReport, Direction, MigrationRecord, BASE_VERSION};
use crate::error::{EngineError, EngineResult};
use crate::ledger::Ledger;
use crate::runner::Runner;
use crate::version::{is_valid_version, parse_version};

/// Ledger-only change computed by [`Migrator::plan_mark`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkPlan {
    /// Record these new migrations as applied, oldest first
    Insert(Vec<String>),
    /// Remove these applied migrations from the ledger, newest first
    Delete(Vec<String>),
    /// The ledger is already at the requested version
    AlreadyAt,
}

/// What [`Migrator::plan_to`] will do
#[derive(Debug, Clone)]
pub enum TargetPlan {
    /// Apply these new migrations, oldest first
    Apply(MigrationSet),
    /// Revert these applied migrations, newest first
    Revert(MigrationSet),
    AlreadyAt,
}

/// Batch operations for one migrations directory and ledger
#[derive(Clone)]
pub struct Migrator {
    ledger: Arc<dyn Ledger>,
    collector: Collector,
    runner: Runner,
}

impl Migrator {
    pub fn new(ledger: Arc<dyn Ledger>, collector: Collector) -> Self {
        let runner = Runner::new(Arc::clone(&ledger));
        Self {
            ledger,
            collector,
            runner,
        }
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Finalized history, newest first; `limit == 0` returns everything
    pub async fn history(&self, limit: usize) -> EngineResult<Vec<MigrationRecord>> {
        self.ledger.ensure_ledger().await?;
        self.ledger.history(non_zero(limit)).await
    }

    /// Migrations not yet in the ledger, oldest first; `limit == 0` returns everything
    pub async fn new_migrations(&self, limit: usize) -> EngineResult<MigrationSet> {
        let mut migrations = self.collector.new_migrations(self.ledger.as_ref()).await?;
        migrations.truncate(limit);
        Ok(migrations)
    }

    /// The last `limit` applied migrations, newest first; `limit == 0` selects all.
    ///
    /// Every selected ledger row must have a source in the migrations directory or
    /// the registry.
    pub async fn applied_migrations(&self, limit: usize) -> EngineResult<MigrationSet> {
        let history = self.history(limit).await?;
        if history.is_empty() {
            return Ok(MigrationSet::default());
        }

        // History is ordered by apply time, so the key range needs both extremes.
        let keys = history
            .iter()
            .map(|r| parse_version(&r.version))
            .collect::<EngineResult<Vec<u64>>>()?;
        let low = keys.iter().copied().min().unwrap_or_default();
        let high = keys.iter().copied().max().unwrap_or_default();

        let mut migrations = self.collector.collect(low, high)?;
        let wanted: HashSet<&str> = history.iter().map(|r| r.version.as_str()).collect();
        migrations.retain(|m| wanted.contains(m.version.as_str()));

        let missing = migrations.missing(history.iter().map(|r| r.version.as_str()));
        if !missing.is_empty() {
            return Err(EngineError::InconsistentLedger { versions: missing });
        }

        migrations.reverse();
        Ok(migrations)
    }

    /// Apply up to `limit` new migrations (all when `0`)
    pub async fn up(&self, limit: usize) -> EngineResult<BatchReport> {
        let pending = self.collector.new_migrations(self.ledger.as_ref()).await?;
        if pending.is_empty() {
            info!("No new migrations found. Your system is up-to-date.");
            return Ok(BatchReport::default());
        }

        let available = pending.len();
        let mut batch = pending;
        batch.truncate(limit);
        if batch.len() == available {
            warn!(
                "Total {} new {} to be applied:\n{}",
                batch.len(),
                migrations_noun(batch.len()),
                batch
            );
        } else {
            warn!(
                "Total {} out of {} new {} to be applied:\n{}",
                batch.len(),
                available,
                migrations_noun(available),
                batch
            );
        }

        let report = self.apply_batch(&batch).await?;
        info!("Migrated up successfully.");
        Ok(report)
    }

    /// Revert the last `limit` applied migrations (all when `0`)
    pub async fn down(&self, limit: usize) -> EngineResult<BatchReport> {
        let batch = self.applied_migrations(limit).await?;
        if batch.is_empty() {
            warn!("No migration has been done before.");
            return Ok(BatchReport::default());
        }

        warn!(
            "Total {} {} to be reverted:\n{}",
            batch.len(),
            migrations_noun(batch.len()),
            batch
        );
        let report = self.revert_batch(&batch).await?;
        info!("Migrated down successfully.");
        Ok(report)
    }

    /// Revert then re-apply the last `limit` applied migrations (all when `0`)
    pub async fn redo(&self, limit: usize) -> EngineResult<BatchReport> {
        let batch = self.applied_migrations(limit).await?;
        if batch.is_empty() {
            warn!("No migration has been done before.");
            return Ok(BatchReport::default());
        }
        self.redo_batch(&batch).await
    }

    /// Revert `batch` (newest first) and apply it again in ascending order
    pub async fn redo_batch(&self, batch: &MigrationSet) -> EngineResult<BatchReport> {
        validate(batch, Direction::Down)?;
        validate(batch, Direction::Up)?;

        warn!(
            "Total {} {} to be redone:\n{}",
            batch.len(),
            migrations_noun(batch.len()),
            batch
        );
        if let Err(err) = self.revert_batch(batch).await {
            error!("Migration failed. The rest of the migrations are canceled.");
            return Err(err);
        }

        let mut ascending = batch.clone();
        ascending.reverse();
        let report = match self.apply_batch(&ascending).await {
            Ok(report) => report,
            Err(err) => {
                error!("Migration failed. The rest of the migrations are canceled.");
                return Err(err);
            }
        };

        info!(
            "{} {} redone.",
            report.completed,
            if report.completed == 1 { "migration was" } else { "migrations were" }
        );
        info!("Migration redone successfully.");
        Ok(report)
    }

    /// Work out how to bring the schema to `version`
    pub async fn plan_to(&self, version: &str) -> EngineResult<TargetPlan> {
        parse_version(version)?;

        let pending = self.collector.new_migrations(self.ledger.as_ref()).await?;
        if let Some(index) = pending.position(version) {
            let mut batch = pending;
            batch.truncate(index + 1);
            return Ok(TargetPlan::Apply(batch));
        }

        let history = self.history(0).await?;
        match history.iter().position(|r| r.version == version) {
            Some(0) => Ok(TargetPlan::AlreadyAt),
            Some(index) => Ok(TargetPlan::Revert(self.applied_migrations(index).await?)),
            None => Err(EngineError::VersionNotFound {
                version: version.to_string(),
            }),
        }
    }

    /// Apply or revert migrations until `version` is the newest applied one
    pub async fn to(&self, version: &str) -> EngineResult<BatchReport> {
        match self.plan_to(version).await? {
            TargetPlan::Apply(batch) => self.apply_batch(&batch).await,
            TargetPlan::Revert(batch) => self.revert_batch(&batch).await,
            TargetPlan::AlreadyAt => {
                warn!("Already at '{}'. Nothing needs to be done.", version);
                Ok(BatchReport::default())
            }
        }
    }

    /// Work out the ledger change that sets history at `version`
    pub async fn plan_mark(&self, version: &str) -> EngineResult<MarkPlan> {
        if !is_valid_version(version) {
            return Err(EngineError::InvalidVersionFormat {
                version: version.to_string(),
            });
        }

        let pending = self.collector.new_migrations(self.ledger.as_ref()).await?;
        if let Some(index) = pending.position(version) {
            let versions = pending.versions().into_iter().take(index + 1).collect();
            return Ok(MarkPlan::Insert(versions));
        }

        let history = self.history(0).await?;
        if let Some(index) = history.iter().position(|r| r.version == version) {
            if index == 0 {
                return Ok(MarkPlan::AlreadyAt);
            }
            let versions = history.into_iter().take(index).map(|r| r.version).collect();
            return Ok(MarkPlan::Delete(versions));
        }

        if version == BASE_VERSION {
            let versions: Vec<String> = history.into_iter().map(|r| r.version).collect();
            return Ok(if versions.is_empty() {
                MarkPlan::AlreadyAt
            } else {
                MarkPlan::Delete(versions)
            });
        }

        Err(EngineError::VersionNotFound {
            version: version.to_string(),
        })
    }

    /// Write the ledger change of `plan` without running any migration
    pub async fn apply_mark(&self, version: &str, plan: &MarkPlan) -> EngineResult<()> {
        let mut conn = self.ledger.connection().await?;
        match plan {
            MarkPlan::Insert(versions) => {
                for v in versions {
                    conn.insert_final_record(v)
                        .await
                        .map_err(|err| EngineError::ledger_write(v, err))?;
                }
            }
            MarkPlan::Delete(versions) => {
                for v in versions {
                    conn.delete_record(v)
                        .await
                        .map_err(|err| EngineError::ledger_write(v, err))?;
                }
            }
            MarkPlan::AlreadyAt => {
                warn!("Already at '{}'. Nothing needs to be done.", version);
                return Ok(());
            }
        }

        info!(
            "The migration history is set at {}. No actual migration was performed.",
            version
        );
        Ok(())
    }

    /// Set the ledger at `version` without running migrations
    pub async fn mark(&self, version: &str) -> EngineResult<MarkPlan> {
        let plan = self.plan_mark(version).await?;
        self.apply_mark(version, &plan).await?;
        Ok(plan)
    }

    /// Apply `batch` in order, stopping at the first failure
    pub async fn apply_batch(&self, batch: &MigrationSet) -> EngineResult<BatchReport> {
        self.run_batch(batch, Direction::Up).await
    }

    /// Revert `batch` in order, stopping at the first failure
    pub async fn revert_batch(&self, batch: &MigrationSet) -> EngineResult<BatchReport> {
        self.run_batch(batch, Direction::Down).await
    }

    async fn run_batch(&self, batch: &MigrationSet, direction: Direction) -> EngineResult<BatchReport> {
        validate(batch, direction)?;

        let verb = match direction {
            Direction::Up => "applied",
            Direction::Down => "reverted",
        };
        let mut report = BatchReport::with_total(batch.len());

        for migration in batch {
            match self.runner.run(migration, direction).await {
                Ok(outcome) => report.record(&migration.version, outcome),
                Err(err) => {
                    error!(
                        "{} from {} {} {}.",
                        report.completed,
                        report.total,
                        if report.completed == 1 { "migration was" } else { "migrations were" },
                        verb
                    );
                    return Err(err);
                }
            }
        }

        info!(
            "{} {} {}.",
            report.completed,
            if report.completed == 1 { "migration was" } else { "migrations were" },
            verb
        );
        if report.skipped > 0 {
            warn!(
                "{} {} left to another process.",
                report.skipped,
                migrations_noun(report.skipped)
            );
        }
        Ok(report)
    }
}

/// Resolve every plan up front so grammar and registration errors abort the
/// batch before the database is touched.
fn validate(batch: &MigrationSet, direction: Direction) -> EngineResult<()> {
    for migration in batch {
        migration.plan(direction)?;
    }
    Ok(())
}

fn non_zero(limit: usize) -> Option<usize> {
    (limit > 0).then_some(limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::registry::MigrationRegistry;
    use std::fs;
    use tempfile::TempDir;

    const M1: &str = "m200101_000000_create_accounts";
    const M2: &str = "m200102_000000_create_orders";
    const M3: &str = "m200103_000000_create_invoices";

    fn script(table: &str) -> String {
        format!(
            "-- +gomigrate Up\nCREATE TABLE {table} (id INT);\n-- +gomigrate Down\nDROP TABLE {table};\n"
        )
    }

    struct Fixture {
        _dir: TempDir,
        ledger: MemoryLedger,
        migrator: Migrator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        for (version, table) in [(M1, "accounts"), (M2, "orders"), (M3, "invoices")] {
            fs::write(dir.path().join(format!("{}.sql", version)), script(table)).unwrap();
        }
        let ledger = MemoryLedger::new();
        let collector = Collector::new(dir.path(), Arc::new(MigrationRegistry::new()));
        let migrator = Migrator::new(Arc::new(ledger.clone()), collector);
        Fixture {
            _dir: dir,
            ledger,
            migrator,
        }
    }

    async fn history_versions(migrator: &Migrator) -> Vec<String> {
        migrator
            .history(0)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect()
    }

    #[tokio::test]
    async fn test_up_applies_in_order() {
        let f = fixture();

        let report = f.migrator.up(0).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.completed, 3);
        assert_eq!(report.versions, vec![M1, M2, M3]);
        assert_eq!(
            f.ledger.executed(),
            vec![
                "CREATE TABLE accounts (id INT);\n",
                "CREATE TABLE orders (id INT);\n",
                "CREATE TABLE invoices (id INT);\n"
            ]
        );

        let again = f.migrator.up(0).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_up_with_limit() {
        let f = fixture();

        let report = f.migrator.up(2).await.unwrap();
        assert_eq!(report.versions, vec![M1, M2]);

        let pending = f.migrator.new_migrations(0).await.unwrap();
        assert_eq!(pending.versions(), vec![M3]);
    }

    #[tokio::test]
    async fn test_down_reverts_newest() {
        let f = fixture();
        f.migrator.up(0).await.unwrap();

        let report = f.migrator.down(1).await.unwrap();
        assert_eq!(report.versions, vec![M3]);
        assert_eq!(history_versions(&f.migrator).await, vec![M2, M1]);
        assert_eq!(
            f.ledger.executed().last().map(String::as_str),
            Some("DROP TABLE invoices;\n")
        );

        let report = f.migrator.down(0).await.unwrap();
        assert_eq!(report.versions, vec![M2, M1]);
        assert!(history_versions(&f.migrator).await.is_empty());
    }

    #[tokio::test]
    async fn test_down_with_missing_source() {
        let f = fixture();
        f.migrator.up(0).await.unwrap();
        f.ledger.seed("m200104_000000_deleted_file", Some(i64::MAX));

        let err = f.migrator.down(1).await.unwrap_err();
        match err {
            EngineError::InconsistentLedger { versions } => {
                assert_eq!(versions, vec!["m200104_000000_deleted_file".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(history_versions(&f.migrator).await.len(), 4);
    }

    #[tokio::test]
    async fn test_down_after_out_of_order_apply() {
        let f = fixture();
        // M2 arrived late and was applied after M3.
        f.ledger.seed(M1, Some(10));
        f.ledger.seed(M3, Some(20));
        f.ledger.seed(M2, Some(30));

        let batch = f.migrator.applied_migrations(0).await.unwrap();
        assert_eq!(batch.versions(), vec![M3, M2, M1]);

        let report = f.migrator.down(2).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(history_versions(&f.migrator).await, vec![M1]);

        let report = f.migrator.down(0).await.unwrap();
        assert_eq!(report.versions, vec![M1]);
        assert!(history_versions(&f.migrator).await.is_empty());
    }

    #[tokio::test]
    async fn test_redo_last_migration() {
        let f = fixture();
        f.migrator.up(0).await.unwrap();

        let report = f.migrator.redo(1).await.unwrap();
        assert_eq!(report.versions, vec![M3]);
        assert_eq!(history_versions(&f.migrator).await, vec![M3, M2, M1]);

        let executed = f.ledger.executed();
        assert_eq!(
            &executed[3..],
            &["DROP TABLE invoices;\n", "CREATE TABLE invoices (id INT);\n"]
        );
    }

    #[tokio::test]
    async fn test_to_moves_both_ways() {
        let f = fixture();

        let report = f.migrator.to(M2).await.unwrap();
        assert_eq!(report.versions, vec![M1, M2]);

        let report = f.migrator.to(M2).await.unwrap();
        assert!(report.is_empty());

        f.migrator.up(0).await.unwrap();
        let report = f.migrator.to(M1).await.unwrap();
        assert_eq!(report.versions, vec![M3, M2]);
        assert_eq!(history_versions(&f.migrator).await, vec![M1]);

        assert!(matches!(
            f.migrator.to("m209912_000000_unknown").await,
            Err(EngineError::VersionNotFound { .. })
        ));
        assert!(matches!(
            f.migrator.to("bogus").await,
            Err(EngineError::InvalidVersionFormat { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_touches_ledger_only() {
        let f = fixture();

        let plan = f.migrator.mark(M2).await.unwrap();
        assert_eq!(plan, MarkPlan::Insert(vec![M1.to_string(), M2.to_string()]));
        assert!(f.ledger.executed().is_empty());
        assert_eq!(history_versions(&f.migrator).await.len(), 2);

        let plan = f.migrator.mark(M1).await.unwrap();
        assert_eq!(plan, MarkPlan::Delete(vec![M2.to_string()]));
        assert_eq!(f.migrator.mark(M1).await.unwrap(), MarkPlan::AlreadyAt);

        f.migrator.mark(BASE_VERSION).await.unwrap();
        assert!(history_versions(&f.migrator).await.is_empty());
        assert!(f.ledger.executed().is_empty());

        assert!(matches!(
            f.migrator.mark("m1_bad").await,
            Err(EngineError::InvalidVersionFormat { .. })
        ));
    }

    #[tokio::test]
    async fn test_grammar_error_aborts_before_any_change() {
        let f = fixture();
        fs::write(
            f.migrator.collector().directory().join("m200104_000000_broken.sql"),
            "-- +gomigrate Down\nDROP TABLE x;\n-- +gomigrate Up\nCREATE TABLE x;\n",
        )
        .unwrap();

        let err = f.migrator.up(0).await.unwrap_err();
        assert!(matches!(err, EngineError::Parse { .. }));
        assert!(f.ledger.executed().is_empty());
        assert!(history_versions(&f.migrator).await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_stops_the_batch() {
        let f = fixture();
        f.ledger.fail_statement("CREATE TABLE orders");

        let err = f.migrator.up(0).await.unwrap_err();
        assert!(matches!(err, EngineError::Function { .. }));
        assert_eq!(history_versions(&f.migrator).await, vec![M1]);
        assert_eq!(f.ledger.row(M2), None);
        assert_eq!(f.ledger.row(M3), None);
    }
}
