use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Environment variable error: {message}")]
    EnvironmentError { message: String },

    #[error("Cannot read configuration file {path}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    /// Create a missing required field error
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }

    /// Create an environment error
    pub fn environment_error(message: impl Into<String>) -> Self {
        Self::EnvironmentError {
            message: message.into(),
        }
    }
}

/// Trait for validating configuration values
pub trait ConfigValidator<T: ?Sized> {
    /// Validate a configuration value
    fn validate(&self, value: &T) -> Result<(), ConfigError>;
}

static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid identifier regex")
});

/// Ledger table name: a plain SQL identifier, optionally schema-qualified
pub struct TableNameValidator {
    pub max_length: usize,
}

impl Default for TableNameValidator {
    fn default() -> Self {
        // Postgres truncates identifiers longer than this
        Self { max_length: 63 }
    }
}

impl ConfigValidator<str> for TableNameValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::missing_required(
                "migration_table",
                "Set -t/--migration-table or GOMIGRATE_MIGRATION_TABLE",
            ));
        }

        if !IDENTIFIER_REGEX.is_match(value) {
            return Err(ConfigError::invalid_value(
                "migration_table",
                value,
                "a plain SQL identifier such as 'migration' or 'public.migration'",
            ));
        }

        if value.split('.').any(|part| part.len() > self.max_length) {
            return Err(ConfigError::invalid_value(
                "migration_table",
                value,
                format!("identifier parts of at most {} characters", self.max_length),
            ));
        }

        Ok(())
    }
}

/// Database URL validator
pub struct DsnValidator {
    pub schemes: Vec<String>,
}

impl Default for DsnValidator {
    fn default() -> Self {
        Self {
            schemes: vec!["postgres".to_string(), "postgresql".to_string()],
        }
    }
}

impl ConfigValidator<str> for DsnValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::invalid_value(
                "database_url",
                value,
                "non-empty database URL",
            ));
        }

        let has_valid_scheme = self
            .schemes
            .iter()
            .any(|scheme| value.starts_with(&format!("{}://", scheme)));

        if !has_valid_scheme {
            // Never echo the URL back, it usually carries a password.
            return Err(ConfigError::invalid_value(
                "database_url",
                "<redacted>",
                format!("URL with scheme: {}", self.schemes.join(", ")),
            ));
        }

        Ok(())
    }
}

/// Migrations directory validator
pub struct DirectoryValidator;

impl ConfigValidator<Path> for DirectoryValidator {
    fn validate(&self, value: &Path) -> Result<(), ConfigError> {
        if !value.is_dir() {
            return Err(ConfigError::invalid_value(
                "migrations_path",
                value.display().to_string(),
                "an existing directory",
            ));
        }
        Ok(())
    }
}
