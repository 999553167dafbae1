//! Loading of Quire project settings and per-directory document configuration.
//!
//! Two layers are handled here. `quire.toml` at the project root holds engine
//! settings ([`ProjectConfig`]). Per-directory JSON files (named `.quire` by
//! default) declare documents: a pattern, optionally followed by `|filter`
//! aliases, mapped to parameters. Those files are merged root-to-leaf into a
//! [`ConfigTree`] that the graph resolver consumes.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod params;
pub mod tree;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, load_config_or_default, CONFIG_FILE_NAME};
pub use params::{DocParams, InputDirective};
pub use tree::{load_tree, ConfigTree, DirectoryConfig};
pub use types::*;
