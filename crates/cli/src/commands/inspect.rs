use anyhow::Result;
use gomigrate_engine::{MigrationRecord, Migrator};
use tracing::{info, warn};

const TIME_FORMAT: &str = "%y-%m-%d %H:%M:%S";

/// Show the newest `limit` applied migrations (`0` for all)
pub async fn history(migrator: &Migrator, limit: usize) -> Result<()> {
    let records = migrator.history(limit).await?;
    if records.is_empty() {
        warn!("No migration has been done before.");
        return Ok(());
    }

    let n = records.len();
    if limit > 0 {
        warn!(
            "Showing the last {} applied {}:",
            n,
            if n == 1 { "migration" } else { "migrations" }
        );
    } else {
        warn!(
            "Total {} {} been applied before:",
            n,
            if n == 1 { "migration has" } else { "migrations have" }
        );
    }

    for record in &records {
        info!("{}", format_record(record));
    }
    Ok(())
}

/// Show up to `limit` pending migrations (`0` for all)
pub async fn new(migrator: &Migrator, limit: usize) -> Result<()> {
    let pending = migrator.new_migrations(0).await?;
    if pending.is_empty() {
        info!("No new migrations found. Your system is up-to-date.");
        return Ok(());
    }

    let n = pending.len();
    let noun = if n == 1 { "migration" } else { "migrations" };
    let mut shown = pending;
    shown.truncate(limit);
    if shown.len() < n {
        warn!("Showing {} out of {} new {}:", shown.len(), n, noun);
    } else {
        warn!("Found {} new {}:", n, noun);
    }

    for migration in &shown {
        info!("\t{}", migration.version);
    }
    Ok(())
}

fn format_record(record: &MigrationRecord) -> String {
    match record.applied_at() {
        Some(at) => format!("\t({}) {}", at.format(TIME_FORMAT), record.version),
        None => format!("\t(?) {}", record.version),
    }
}
