//! Error types for filters and for running a batch.

use std::path::PathBuf;

use quire_cache::{CacheError, PayloadKind};
use quire_common::InternalError;
use quire_config::ConfigError;
use quire_graph::GraphError;

use crate::document::DocState;

/// Errors raised by a single filter invocation.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// The filter cannot consume the payload it was handed.
    #[error("filter '{alias}' cannot process {kind:?} input")]
    Unsupported {
        /// The filter alias.
        alias: String,
        /// Shape of the rejected payload.
        kind: PayloadKind,
    },

    /// The filter reported a failure.
    #[error("filter '{alias}' failed: {reason}")]
    Failed {
        /// The filter alias.
        alias: String,
        /// Description of the failure.
        reason: String,
    },

    /// An external command exited unsuccessfully.
    #[error("command for filter '{alias}' exited with {status}: {stderr}")]
    Command {
        /// The filter alias.
        alias: String,
        /// Exit status as reported by the OS.
        status: String,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// An external command ran longer than its timeout.
    #[error("filter '{alias}' timed out after {secs}s")]
    Timeout {
        /// The filter alias.
        alias: String,
        /// The timeout that was exceeded, in seconds.
        secs: u64,
    },

    /// The filter panicked. The panic was caught and the step failed.
    #[error("filter '{alias}' panicked: {message}")]
    Panicked {
        /// The filter alias.
        alias: String,
        /// The panic payload, when it was a string.
        message: String,
    },

    /// An I/O error while driving the filter.
    #[error("filter '{alias}' I/O error: {source}")]
    Io {
        /// The filter alias.
        alias: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// Errors that can occur while planning or running a batch.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid project or directory configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Invalid document graph, including static cycles.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Artifact store or ledger failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A bug in the engine.
    #[error(transparent)]
    Internal(#[from] InternalError),

    /// A document names a filter alias nothing registered.
    #[error("document {document} uses unknown filter '{alias}'")]
    UnknownFilter {
        /// The document key.
        document: String,
        /// The missing alias.
        alias: String,
    },

    /// Two filters were registered under one alias.
    #[error("filter alias '{0}' is registered twice")]
    DuplicateFilter(String),

    /// A filter does not accept the extension produced by the step before it.
    #[error(
        "filter '{filter}' in {document} does not accept '{ext}' (accepts: {})",
        accepted.join(", ")
    )]
    IncompatibleExtension {
        /// The document key.
        document: String,
        /// The filter alias.
        filter: String,
        /// The extension handed to the filter.
        ext: String,
        /// Extensions the filter accepts.
        accepted: Vec<String>,
    },

    /// No output of one filter is accepted by the next one.
    #[error(
        "in {document}, filter '{filter}' produces {} but '{next}' accepts only {}",
        outputs.join(", "),
        accepted.join(", ")
    )]
    NoCommonExtension {
        /// The document key.
        document: String,
        /// The producing filter alias.
        filter: String,
        /// The consuming filter alias.
        next: String,
        /// Extensions the producing filter can emit.
        outputs: Vec<String>,
        /// Extensions the consuming filter accepts.
        accepted: Vec<String>,
    },

    /// A filter failed while building an artifact.
    #[error("{artifact} in {document}: {source}")]
    Filter {
        /// The document key.
        document: String,
        /// The artifact key being built.
        artifact: String,
        /// The filter failure.
        source: FilterError,
    },

    /// The raw source of a document could not be read.
    #[error("cannot read source of {document} at {path}: {source}")]
    Source {
        /// The document key.
        document: String,
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A remote source could not be fetched and no local copy exists.
    #[error("cannot fetch {url}: {reason}")]
    Fetch {
        /// The requested URL.
        url: String,
        /// Description of the failure.
        reason: String,
    },

    /// A document was re-entered while it was already running.
    #[error("circular dependency at runtime: {}", chain.join(" -> "))]
    CircularDependency {
        /// Document keys on the call stack, ending with the re-entered one.
        chain: Vec<String>,
    },

    /// A document was moved to a state its current state cannot reach.
    #[error("internal error: document {document} cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The document key.
        document: String,
        /// The current state.
        from: DocState,
        /// The requested state.
        to: DocState,
    },

    /// A reporter could not write its output.
    #[error("reporter '{reporter}' failed at {path}: {source}")]
    Report {
        /// The reporter name.
        reporter: String,
        /// The path being written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl EngineError {
    /// Returns `true` for errors that end the run regardless of run mode.
    ///
    /// Internal errors count whether they were raised by the engine or
    /// surfaced through the cache layer.
    pub fn is_always_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Graph(_)
                | Self::Internal(_)
                | Self::Cache(CacheError::Internal(_))
                | Self::CircularDependency { .. }
                | Self::InvalidStateTransition { .. }
        )
    }

    /// Returns `true` for failures that `ignore-errors` mode downgrades to a
    /// warning.
    pub fn is_filter_failure(&self) -> bool {
        matches!(self, Self::Filter { .. })
    }
}
