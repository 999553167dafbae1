//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::{ProjectConfig, StoreKind};
use std::path::Path;

/// File name of the project settings file at the project root.
pub const CONFIG_FILE_NAME: &str = "quire.toml";

/// Upper bound on `build.workers`.
const MAX_WORKERS: usize = 256;

/// Loads and validates `quire.toml` from a project directory.
///
/// Reads `<project_dir>/quire.toml`, parses it, and validates it.
pub fn load_config(project_dir: &Path) -> Result<ProjectConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE_NAME);
    let content = std::fs::read_to_string(&config_path)?;
    load_config_from_str(&content)
}

/// Like [`load_config`], but falls back to defaults when `quire.toml` does
/// not exist. A file that exists but does not parse is still an error.
pub fn load_config_or_default(project_dir: &Path) -> Result<ProjectConfig, ConfigError> {
    if project_dir.join(CONFIG_FILE_NAME).is_file() {
        load_config(project_dir)
    } else {
        Ok(ProjectConfig::default())
    }
}

/// Parses and validates a `quire.toml` configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<ProjectConfig, ConfigError> {
    let config: ProjectConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates that configuration values are consistent.
fn validate_config(config: &ProjectConfig) -> Result<(), ConfigError> {
    if config.build.workers > MAX_WORKERS {
        return Err(ConfigError::ValidationError(format!(
            "build.workers must be at most {MAX_WORKERS}, got {}",
            config.build.workers
        )));
    }
    if config.build.workdir.trim().is_empty() {
        return Err(ConfigError::MissingField("build.workdir".to_string()));
    }
    if config.build.config_file.trim().is_empty() {
        return Err(ConfigError::MissingField("build.config_file".to_string()));
    }
    if config.build.store == StoreKind::Http {
        let url = config.build.store_url.as_deref().unwrap_or_default().trim();
        if url.is_empty() {
            return Err(ConfigError::MissingField("build.store_url".to_string()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "build.store_url must be an http or https URL, got '{url}'"
            )));
        }
    }
    let bucket = &config.build.store_bucket;
    if bucket.is_empty() || !bucket.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return Err(ConfigError::ValidationError(format!(
            "build.store_bucket may only hold letters, digits and '-', got '{bucket}'"
        )));
    }
    for (alias, filter) in &config.filters {
        if alias.is_empty() || alias.contains('|') || alias.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "invalid filter alias '{alias}'"
            )));
        }
        if filter.command.is_empty() {
            return Err(ConfigError::MissingField(format!("filters.{alias}.command")));
        }
        if filter.output_extensions.is_empty() {
            return Err(ConfigError::MissingField(format!(
                "filters.{alias}.output_extensions"
            )));
        }
    }
    Ok(())
}
