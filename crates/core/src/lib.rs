//! # gomigrate-core
//!
//! Configuration loading and logging bootstrap shared by the gomigrate binary
//! and by applications embedding the migration engine.

pub mod config;
pub mod logging;

pub use config::{ConfigError, ConfigOverrides, ConfigSource, MigrateConfig};
pub use logging::{init_logging, LoggingConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get tool version
pub fn version() -> &'static str {
    VERSION
}
