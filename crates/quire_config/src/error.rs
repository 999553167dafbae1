//! Error types for configuration loading and validation.

use std::path::PathBuf;

/// Errors that can occur when loading `quire.toml` or the per-directory
/// document configuration.
///
/// Every variant is a user error: the run stops before any document is built.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An I/O error occurred while reading a configuration file.
    #[error("failed to read configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// The TOML content could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A per-directory config file is not valid JSON or not a JSON object.
    #[error("config file {path} has invalid JSON: {reason}")]
    InvalidJson {
        /// The offending config file.
        path: PathBuf,
        /// Description of the parse failure.
        reason: String,
    },

    /// A document entry has a parameter of the wrong shape.
    #[error("invalid entry '{pattern}': {reason}")]
    InvalidEntry {
        /// The entry's pattern key, including any filter aliases.
        pattern: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A required field is missing from the configuration.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// A configuration value failed validation.
    #[error("validation error: {0}")]
    ValidationError(String),
}
