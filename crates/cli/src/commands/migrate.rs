use anyhow::Result;
use gomigrate_engine::{MarkPlan, Migrator, BASE_VERSION};
use tracing::{info, warn};

use super::Context;

pub async fn up(migrator: &Migrator, limit: usize) -> Result<()> {
    migrator.up(limit).await?;
    Ok(())
}

pub async fn down(migrator: &Migrator, limit: usize) -> Result<()> {
    migrator.down(limit).await?;
    Ok(())
}

pub async fn redo(context: &Context, migrator: &Migrator, limit: usize) -> Result<()> {
    let batch = migrator.applied_migrations(limit).await?;
    if batch.is_empty() {
        warn!("No migration has been done before.");
        return Ok(());
    }

    let noun = if batch.len() == 1 { "migration" } else { "migrations" };
    warn!("Total {} {} to be redone:\n{}", batch.len(), noun, batch);
    if !context.confirm(&format!("Redo the above {}?", noun))? {
        info!("Redo canceled.");
        return Ok(());
    }

    migrator.redo_batch(&batch).await?;
    Ok(())
}

pub async fn to(migrator: &Migrator, version: &str) -> Result<()> {
    migrator.to(version).await?;
    Ok(())
}

pub async fn mark(context: &Context, migrator: &Migrator, version: &str) -> Result<()> {
    let plan = migrator.plan_mark(version).await?;
    match &plan {
        MarkPlan::AlreadyAt => {}
        MarkPlan::Insert(versions) => {
            warn!(
                "These migrations will be recorded as applied without running:\n{}",
                listing(versions)
            );
        }
        MarkPlan::Delete(versions) if version == BASE_VERSION => {
            warn!(
                "The whole migration history will be cleared:\n{}",
                listing(versions)
            );
        }
        MarkPlan::Delete(versions) => {
            warn!(
                "These migrations will be removed from the history without reverting:\n{}",
                listing(versions)
            );
        }
    }

    if plan != MarkPlan::AlreadyAt
        && !context.confirm(&format!("Set migration history at {}?", version))?
    {
        info!("Mark canceled.");
        return Ok(());
    }

    migrator.apply_mark(version, &plan).await?;
    Ok(())
}

fn listing(versions: &[String]) -> String {
    versions.iter().map(|v| format!("\t{}\n", v)).collect()
}
