pub mod create;
pub mod inspect;
pub mod migrate;

use anyhow::{Context as _, Result};
use gomigrate_core::MigrateConfig;
use gomigrate_engine::{Collector, MigrationRegistry, Migrator, PostgresLedger};
use inquire::Confirm;
use std::sync::Arc;

use crate::Commands;

/// Everything a command needs besides its own arguments
pub struct Context {
    pub config: MigrateConfig,
    pub registry: Arc<MigrationRegistry>,
    /// Skip confirmation prompts
    pub assume_yes: bool,
}

impl Context {
    /// Connect to the database and build a migrator over the configured directory
    pub async fn migrator(&self) -> Result<Migrator> {
        self.config.validate()?;
        let directory = self.config.require_migrations_path()?;
        let url = self.config.require_database_url()?;

        let ledger = PostgresLedger::connect(url, &self.config.migration_table)
            .await
            .context("gomigrate: cannot connect to the database")?;
        let collector = Collector::new(directory, Arc::clone(&self.registry))
            .with_directive_tool(self.config.directive_tool.as_str());

        Ok(Migrator::new(Arc::new(ledger), collector))
    }

    /// Ask `question`, defaulting to no. `--yes` answers for the user.
    pub fn confirm(&self, question: &str) -> Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        Confirm::new(question)
            .with_default(false)
            .prompt()
            .context("failed to read confirmation")
    }
}

/// Run one command
pub async fn dispatch(context: &Context, command: Commands) -> Result<()> {
    match command {
        Commands::Create { name, kind } => create::run(context, &name, kind),
        Commands::Up { limit } => migrate::up(&context.migrator().await?, limit).await,
        Commands::Down { limit } => migrate::down(&context.migrator().await?, limit).await,
        Commands::Redo { limit } => migrate::redo(context, &context.migrator().await?, limit).await,
        Commands::To { version } => migrate::to(&context.migrator().await?, &version).await,
        Commands::Mark { version } => {
            migrate::mark(context, &context.migrator().await?, &version).await
        }
        Commands::History { limit } => inspect::history(&context.migrator().await?, limit).await,
        Commands::New { limit } => inspect::new(&context.migrator().await?, limit).await,
    }
}
