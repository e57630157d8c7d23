//! Migration Definitions - Core types shared across the engine
//!
//! Directions, ledger records, step outcomes and batch reports.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::fmt;

/// Sentinel ledger row written when the ledger is created
pub const BASE_VERSION: &str = "m000000_000000_base";

/// Default name of the ledger table
pub const DEFAULT_LEDGER_TABLE: &str = "migration";

/// Default directive marker recognised in scripts (`-- +gomigrate Up`)
pub const DEFAULT_DIRECTIVE_TOOL: &str = "gomigrate";

/// Applied versions mapped to their apply time; `None` marks a provisional row
pub type AppliedSet = HashMap<String, Option<i64>>;

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Apply the migration
    Up,
    /// Revert the migration
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finalized ledger row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Version identifier
    pub version: String,
    /// Seconds since the epoch
    pub apply_time: i64,
}

impl MigrationRecord {
    pub fn new(version: impl Into<String>, apply_time: i64) -> Self {
        Self {
            version: version.into(),
            apply_time,
        }
    }

    /// Apply time as a UTC timestamp
    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.apply_time, 0).single()
    }
}

/// Current time in ledger units
pub(crate) fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// What the runner did with a single migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The migration body ran and the ledger was updated
    Executed,
    /// Nothing to run for this direction; only the ledger was updated
    Empty,
    /// Another process holds this version; nothing was done
    Skipped,
}

impl StepOutcome {
    /// Whether the step counts towards the completed total of a batch
    pub fn is_completed(&self) -> bool {
        !matches!(self, StepOutcome::Skipped)
    }
}

/// Result of running a batch of migrations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Number of migrations selected for the batch
    pub total: usize,
    /// Migrations executed or recorded as empty
    pub completed: usize,
    /// Migrations left to a concurrent process
    pub skipped: usize,
    /// Versions in the order they were processed
    pub versions: Vec<String>,
}

impl BatchReport {
    pub(crate) fn with_total(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, version: &str, outcome: StepOutcome) {
        if outcome.is_completed() {
            self.completed += 1;
        } else {
            self.skipped += 1;
        }
        self.versions.push(version.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Pluralised noun for batch log lines
pub(crate) fn migrations_noun(count: usize) -> &'static str {
    if count == 1 {
        "migration"
    } else {
        "migrations"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_report_counts_skips_separately() {
        let mut report = BatchReport::with_total(3);
        report.record("m200101_000000_a", StepOutcome::Executed);
        report.record("m200101_000001_b", StepOutcome::Skipped);
        report.record("m200101_000002_c", StepOutcome::Empty);

        assert_eq!(report.completed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.versions.len(), 3);
    }

    #[test]
    fn test_record_apply_time() {
        let record = MigrationRecord::new("m200101_000000_a", 1_577_836_800);
        let applied = record.applied_at().unwrap();
        assert_eq!(applied.format("%y-%m-%d %H:%M:%S").to_string(), "20-01-01 00:00:00");
    }
}
