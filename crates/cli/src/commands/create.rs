use anyhow::Result;
use chrono::Utc;
use gomigrate_engine::{create_migration, TemplateKind};

use super::Context;

/// Write a new migration file into the configured directory
pub fn run(context: &Context, name: &str, kind: TemplateKind) -> Result<()> {
    context.config.validate()?;
    create_migration(
        &context.config.migrations_path,
        name,
        kind,
        &context.config.directive_tool,
        Utc::now(),
    )?;
    Ok(())
}
