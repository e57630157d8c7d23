//! # gomigrate CLI
//!
//! Command surface over [`gomigrate_engine::Migrator`]. The `gomigrate` binary runs
//! it with an empty registry; applications with code migrations build their own
//! binary and call [`run`] with a populated [`MigrationRegistry`].

pub mod commands;

use clap::{Parser, Subcommand};
use gomigrate_core::{init_logging, ConfigError, ConfigOverrides, LoggingConfig, MigrateConfig};
use gomigrate_engine::{EngineError, MigrationRegistry, TemplateKind};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use commands::Context;

/// Exit status for failures without a more specific code
pub const EXIT_FAILURE: u8 = 1;
/// Exit status for I/O and database failures (`EX_IOERR`)
pub const EXIT_IO_ERROR: u8 = 74;

#[derive(Parser, Debug)]
#[command(name = "gomigrate")]
#[command(version, about = "Versioned database schema migrations")]
pub struct Cli {
    /// YAML configuration file
    #[arg(short = 'c', long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory containing the migrations
    #[arg(short = 'p', long, global = true, value_name = "DIR")]
    pub migrations_path: Option<PathBuf>,

    /// Table which records applied migrations
    #[arg(short = 't', long, global = true, value_name = "TABLE")]
    pub migration_table: Option<String>,

    /// Database connection URL
    #[arg(long, global = true, value_name = "URL")]
    pub dsn: Option<String>,

    /// Compact console output
    #[arg(long, global = true)]
    pub compact: bool,

    /// Answer yes to every confirmation
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Upgrade the database by applying new migrations (default)
    Up {
        /// Number of new migrations to apply, or "all"
        #[arg(value_parser = parse_limit, default_value = "all")]
        limit: usize,
    },

    /// Downgrade the database by reverting applied migrations
    Down {
        /// Number of migrations to revert, or "all"
        #[arg(value_parser = parse_limit, default_value = "1")]
        limit: usize,
    },

    /// Revert and re-apply the last migrations
    Redo {
        /// Number of migrations to redo, or "all"
        #[arg(value_parser = parse_limit, default_value = "1")]
        limit: usize,
    },

    /// Upgrade or downgrade until the given version is the newest applied
    To {
        version: String,
    },

    /// Set the migration history at a version without running migrations
    Mark {
        version: String,
    },

    /// Display the migration history
    History {
        /// Number of records to show, or "all"
        #[arg(value_parser = parse_limit, default_value = "10")]
        limit: usize,
    },

    /// Display migrations that have not been applied
    New {
        /// Number of migrations to show, or "all"
        #[arg(value_parser = parse_limit, default_value = "10")]
        limit: usize,
    },

    /// Create a new migration file
    Create {
        /// Letters, digits, underscores and backslashes only
        name: String,

        /// Migration kind: sql or rs
        #[arg(value_parser = parse_kind, default_value = "sql")]
        kind: TemplateKind,
    },
}

impl Cli {
    /// Command-line values that override file and environment configuration
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            migrations_path: self.migrations_path.clone(),
            migration_table: self.migration_table.clone(),
            database_url: self.dsn.clone(),
            compact: self.compact.then_some(true),
        }
    }
}

/// `all` selects everything (`0`); otherwise a positive count
pub fn parse_limit(raw: &str) -> Result<usize, String> {
    if raw.eq_ignore_ascii_case("all") {
        return Ok(0);
    }
    match raw.parse::<usize>() {
        Ok(0) | Err(_) => Err(format!(
            "'{}' is not a positive number or \"all\"",
            raw
        )),
        Ok(limit) => Ok(limit),
    }
}

fn parse_kind(raw: &str) -> Result<TemplateKind, String> {
    raw.parse().map_err(|err: EngineError| err.to_string())
}

/// Parse the process arguments and run the selected command
pub async fn run(registry: MigrationRegistry) -> ExitCode {
    execute(Cli::parse(), registry).await
}

/// Run an already parsed command line
pub async fn execute(cli: Cli, registry: MigrationRegistry) -> ExitCode {
    let config = match MigrateConfig::load(cli.config.as_deref(), &cli.overrides()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("gomigrate error: {}", err);
            return ExitCode::from(exit_code_for(&anyhow::Error::from(err)));
        }
    };

    if let Err(err) = init_logging(&LoggingConfig::console(config.compact)) {
        eprintln!("gomigrate: logging disabled: {}", err);
    }

    let context = Context {
        config,
        registry: Arc::new(registry),
        assume_yes: cli.yes,
    };
    let command = cli.command.unwrap_or(Commands::Up { limit: 0 });

    match commands::dispatch(&context, command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("gomigrate error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// I/O and database failures exit with 74, everything else with 1
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(engine) = cause.downcast_ref::<EngineError>() {
            if matches!(engine, EngineError::Io(_) | EngineError::Database(_)) {
                return EXIT_IO_ERROR;
            }
        }
        if let Some(ConfigError::FileSystem { .. }) = cause.downcast_ref::<ConfigError>() {
            return EXIT_IO_ERROR;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return EXIT_IO_ERROR;
        }
    }
    EXIT_FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit("all"), Ok(0));
        assert_eq!(parse_limit("ALL"), Ok(0));
        assert_eq!(parse_limit("3"), Ok(3));
        assert!(parse_limit("0").is_err());
        assert!(parse_limit("-1").is_err());
        assert!(parse_limit("few").is_err());
    }

    #[test]
    fn test_default_limits() {
        assert_eq!(parse(&["gomigrate", "up"]).command, Some(Commands::Up { limit: 0 }));
        assert_eq!(parse(&["gomigrate", "down"]).command, Some(Commands::Down { limit: 1 }));
        assert_eq!(parse(&["gomigrate", "redo", "all"]).command, Some(Commands::Redo { limit: 0 }));
        assert_eq!(
            parse(&["gomigrate", "history"]).command,
            Some(Commands::History { limit: 10 })
        );
        assert_eq!(parse(&["gomigrate", "new", "2"]).command, Some(Commands::New { limit: 2 }));
        assert_eq!(parse(&["gomigrate"]).command, None);
    }

    #[test]
    fn test_global_flags_and_overrides() {
        let cli = parse(&[
            "gomigrate",
            "-p",
            "db/migrations",
            "to",
            "m210131_171852_add_user_table",
            "-t",
            "schema_migration",
            "--dsn",
            "postgres://localhost/app",
            "--compact",
            "-y",
        ]);

        assert!(cli.yes);
        assert_eq!(
            cli.command,
            Some(Commands::To {
                version: "m210131_171852_add_user_table".to_string()
            })
        );

        let overrides = cli.overrides();
        assert_eq!(overrides.migrations_path, Some(PathBuf::from("db/migrations")));
        assert_eq!(overrides.migration_table.as_deref(), Some("schema_migration"));
        assert_eq!(overrides.database_url.as_deref(), Some("postgres://localhost/app"));
        assert_eq!(overrides.compact, Some(true));

        assert_eq!(parse(&["gomigrate", "up"]).overrides().compact, None);
    }

    #[test]
    fn test_create_kind() {
        assert_eq!(
            parse(&["gomigrate", "create", "add_users"]).command,
            Some(Commands::Create {
                name: "add_users".to_string(),
                kind: TemplateKind::Sql
            })
        );
        assert_eq!(
            parse(&["gomigrate", "create", "backfill", "rs"]).command,
            Some(Commands::Create {
                name: "backfill".to_string(),
                kind: TemplateKind::Rust
            })
        );
        assert!(Cli::try_parse_from(["gomigrate", "create", "x", "go"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let io = anyhow::Error::new(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        )));
        assert_eq!(exit_code_for(&io), EXIT_IO_ERROR);

        let wrapped = io.context("while collecting migrations");
        assert_eq!(exit_code_for(&wrapped), EXIT_IO_ERROR);

        let parse = anyhow::Error::new(EngineError::VersionNotFound {
            version: "m210101_000000_x".to_string(),
        });
        assert_eq!(exit_code_for(&parse), EXIT_FAILURE);

        let config = anyhow::Error::new(ConfigError::validation_failed("bad"));
        assert_eq!(exit_code_for(&config), EXIT_FAILURE);
    }
}
