//! Error types for graph resolution.

use std::path::PathBuf;

use quire_config::ConfigError;

/// Errors raised while turning configuration into an ordered graph.
///
/// Everything except [`GraphError::Cycle`] is a configuration mistake. A
/// cycle carries the full chain of document keys so that the user can see
/// every edge involved.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A config entry is malformed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A pattern key cannot be used.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern key.
        pattern: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A virtual document would be fetched from the network, but remote
    /// sources are not enabled.
    #[error("document '{name}' has no contents and would be fetched remotely; enable allow_remote to permit this")]
    RemoteNotAllowed {
        /// The virtual document name.
        name: String,
    },

    /// A declared input does not name any document.
    #[error("document '{document}' depends on unknown input '{input}'")]
    UnknownInput {
        /// The depending document.
        document: String,
        /// The unresolved input key.
        input: String,
    },

    /// No document matches a requested target.
    #[error("no document matches target '{0}'")]
    UnknownTarget(String),

    /// Documents depend on each other in a loop.
    #[error("circular dependency: {}", chain.join(" -> "))]
    Cycle {
        /// Document keys along the loop; the first key is repeated at the end.
        chain: Vec<String>,
    },

    /// A directory could not be listed.
    #[error("failed to list {path}: {source}")]
    Io {
        /// The directory.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}
