//! Shared plumbing for the subcommands: logging, project discovery and
//! opening the controller.

use std::path::{Path, PathBuf};

use quire_config::CONFIG_FILE_NAME;
use quire_engine::Controller;
use tracing_subscriber::EnvFilter;

use crate::GlobalArgs;

/// Environment variable holding a `tracing` filter directive that overrides
/// the `--quiet` / `--verbose` level.
pub const LOG_ENV: &str = "QUIRE_LOG";

/// Installs the global `tracing` subscriber writing to stderr.
pub fn init_logging(global: &GlobalArgs) {
    let default = if global.quiet {
        "error"
    } else if global.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Walks up from `start` looking for `quire.toml`.
///
/// A project without a settings file is still valid, so when no ancestor has
/// one the starting directory itself is the root.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut current = start.to_path_buf();
    loop {
        if current.join(CONFIG_FILE_NAME).exists() {
            return current;
        }
        if !current.pop() {
            return start.to_path_buf();
        }
    }
}

/// Opens the controller for the project selected by the global flags.
///
/// With `--config` the file is loaded directly and its directory is the
/// project root. A directory passed to `--config` is used as the root.
pub fn open_controller(global: &GlobalArgs) -> Result<Controller, Box<dyn std::error::Error>> {
    if let Some(ref config_path) = global.config {
        let path = PathBuf::from(config_path);
        if path.is_file() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            let config = quire_config::load_config_from_str(&content)?;
            let root = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Ok(Controller::open(&root, config)?);
        }
        return Ok(Controller::open_project(&path)?);
    }
    let root = find_project_root(&std::env::current_dir()?);
    tracing::debug!(root = %root.display(), "using project root");
    Ok(Controller::open_project(&root)?)
}
