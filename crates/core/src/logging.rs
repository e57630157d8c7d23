//! # Logging bootstrap
//!
//! Installs a `tracing-subscriber` registry for the gomigrate binary. `RUST_LOG`
//! always wins over the configured filter.

use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Environment filter (supports directives like "gomigrate_engine=debug,sqlx=warn")
    pub env_filter: Option<String>,
    /// Enable JSON structured logging (vs plain text)
    pub json_format: bool,
    /// Short single-line records without timestamps or targets
    pub compact: bool,
    /// Include file and line number information
    pub include_location: bool,
    /// Include timestamp in logs
    pub include_timestamp: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            env_filter: Some("info,sqlx=warn".to_string()),
            json_format: false,
            compact: false,
            include_location: false,
            include_timestamp: true,
        }
    }
}

impl LoggingConfig {
    /// Create production logging configuration
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            env_filter: Some("info,sqlx=warn".to_string()),
            json_format: true,
            compact: false,
            include_location: false,
            include_timestamp: true,
        }
    }

    /// Create development logging configuration
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            env_filter: Some("gomigrate=debug,gomigrate_engine=debug,sqlx=info".to_string()),
            json_format: false,
            compact: false,
            include_location: true,
            include_timestamp: true,
        }
    }

    /// Create test logging configuration (minimal output)
    pub fn test() -> Self {
        Self {
            level: "error".to_string(),
            env_filter: Some("error".to_string()),
            json_format: false,
            compact: true,
            include_location: false,
            include_timestamp: false,
        }
    }

    /// Console configuration for the CLI, optionally compacted
    pub fn console(compact: bool) -> Self {
        Self {
            compact,
            include_timestamp: !compact,
            ..Self::default()
        }
    }

    /// Set environment filter
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Filter directives used when `RUST_LOG` is not set
    pub fn filter_directives(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }
}

/// Initialize logging for the process.
///
/// Fails when the filter does not parse or a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directives()))?;

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                Layer::new()
                    .with_writer(io::stdout)
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()?;
    } else if config.compact {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                Layer::new()
                    .with_writer(io::stdout)
                    .compact()
                    .without_time()
                    .with_target(false)
                    .with_level(false),
            )
            .try_init()?;
    } else if config.include_timestamp {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                Layer::new()
                    .with_writer(io::stdout)
                    .with_target(config.include_location)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stdout).without_time())
            .try_init()?;
    }

    tracing::debug!(
        target: "gomigrate::logging",
        "Logging initialized (filter: {}, format: {})",
        config.filter_directives(),
        if config.json_format {
            "JSON"
        } else if config.compact {
            "compact"
        } else {
            "text"
        }
    );

    Ok(())
}
